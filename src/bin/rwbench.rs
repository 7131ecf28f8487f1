//! `rwbench`: without `-s`, serve regions to clients until they disconnect;
//! with `-s`, connect to that server, run the benchmark and print the report.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Parser;

use rwbench::bench::{self, BenchConfig, Client, ReapMode, ReportFormat, Server};
use rwbench::Fabric;

#[derive(Parser, Debug)]
#[command(name = "rwbench")]
#[command(about = "Remote write/read latency and throughput benchmark")]
struct Cli {
    /// Server address; runs as a client when given, as a server otherwise
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Local address: the listening address of a server, or the source
    /// address of client connections
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Number of connections
    #[arg(short = 'c', long)]
    connections: Option<usize>,

    /// Message size in bytes
    #[arg(short = 'S', long)]
    size: Option<usize>,

    /// Benchmark time in seconds
    #[arg(short = 't', long)]
    time: Option<u64>,

    /// Port number
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Ack timeout exponent (0-31)
    #[arg(short = 'a', long)]
    ack_timeout: Option<u8>,

    /// Print one CSV record instead of tables
    #[arg(short = 'v', long)]
    csv: bool,

    /// Print the report as JSON
    #[arg(long, conflicts_with = "csv")]
    json: bool,

    /// Back the server regions with this file
    #[arg(long)]
    pmem: Option<PathBuf>,

    /// Sleep on completion channels instead of spinning
    #[arg(long)]
    blocking: bool,

    /// Type of service of the client connections
    #[arg(long)]
    tos: Option<u8>,

    /// Read defaults from the [rwbench] table of this TOML file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn format(&self) -> ReportFormat {
        if self.json {
            ReportFormat::Json
        } else if self.csv {
            ReportFormat::Csv
        } else {
            ReportFormat::Human
        }
    }

    /// Build the configuration: file (or defaults), then flags on top.
    fn config(&self) -> Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::load_toml(path)
                .with_context(|| format!("cannot load {}", path.display()))?,
            None => BenchConfig::default(),
        };
        if let Some(server) = &self.server {
            config.server_addr = server.clone();
        }
        if let Some(bind) = &self.bind {
            config.bind_addr = Some(bind.clone());
        }
        if let Some(n) = self.connections {
            config.connections = n;
        }
        if let Some(size) = self.size {
            config.message_size = size;
        }
        if let Some(secs) = self.time {
            config.duration_ms = secs * 1000;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.ack_timeout.is_some() {
            config.ack_timeout = self.ack_timeout;
        }
        if self.tos.is_some() {
            config.tos = self.tos;
        }
        if self.pmem.is_some() {
            config.durable_path = self.pmem.clone();
        }
        if self.blocking {
            config.reap_mode = ReapMode::Blocking;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_env_log(default_level: &str) {
    let env = env_logger::Env::new().filter_or("RUST_LOG", default_level);
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                Utc::now().format("%H:%M:%S%.6f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

#[cfg(feature = "verbs")]
fn open_fabric() -> Result<Fabric> {
    Fabric::verbs().context("no usable RDMA device")
}

#[cfg(not(feature = "verbs"))]
fn open_fabric() -> Result<Fabric> {
    anyhow::bail!("rwbench was built without the `verbs` feature and cannot reach RDMA devices")
}

/// Accept `config.connections` clients and serve them until they leave.
fn run_server(fabric: &Fabric, config: &BenchConfig) -> Result<()> {
    let host = config.bind_addr.as_deref().unwrap_or("0.0.0.0");
    let addr = bench::addr::resolve_one(host, config.port)?;
    let mut server = Server::bind(fabric, config, addr)?;
    log::info!("rwbench: serving {} connection(s) on {}", config.connections, addr);
    let summary = server.run();
    server.shutdown();
    let summary = summary?;
    log::info!(
        "rwbench: served {} connection(s), {} error(s)",
        summary.exchanged,
        summary.errors
    );
    Ok(())
}

fn run_client(fabric: &Fabric, config: &BenchConfig, format: ReportFormat) -> Result<()> {
    let addrs = bench::addr::resolve(config.bind_addr.as_deref(), &config.server_addr, config.port)?;
    let mut client = Client::new(fabric, config, addrs)?;
    let report = client.run();
    client.shutdown();
    let report = report?;

    print!(
        "{}",
        bench::render(&report, format, format == ReportFormat::Human, Utc::now())?
    );
    if report.failed_workers > 0 {
        log::warn!("rwbench: {} worker(s) stopped early", report.failed_workers);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.format();
    init_env_log(if format == ReportFormat::Human { "info" } else { "warn" });

    let config = cli.config()?;
    let fabric = open_fabric()?;
    if cli.server.is_some() {
        run_client(&fabric, &config, format)
    } else {
        run_server(&fabric, &config)
    }
}

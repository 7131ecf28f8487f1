use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::engine::ReapMode;
use super::error::BenchError;

/// Benchmark configuration.
///
/// Every field has a default, so a TOML table only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// Number of connections, and of workers on the client.
    pub connections: usize,
    /// Size of each remote write and read, in bytes.
    pub message_size: usize,
    /// Port the server listens on.
    pub port: u16,
    /// Measurement window, in milliseconds.
    pub duration_ms: u64,
    /// Delay between spawning the workers and opening the start gate.
    pub prepare_ms: u64,
    /// Type of service of the client connections.
    pub tos: Option<u8>,
    /// Ack timeout exponent of the client connections, 0..=31.
    pub ack_timeout: Option<u8>,
    /// Send and receive queue depth of each connection.
    pub queue_depth: u32,
    /// Listen backlog of the server.
    pub backlog: i32,
    /// How completions are reaped.
    pub reap_mode: ReapMode,
    /// Back the benchmark buffers with this file instead of the heap.
    pub durable_path: Option<PathBuf>,
    /// Bound on each connection manager event wait, in milliseconds.
    pub cm_timeout_ms: Option<u64>,
    /// Address the client connects to.
    pub server_addr: String,
    /// Local address the client binds to, or the server listens on.
    pub bind_addr: Option<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            connections: 1,
            message_size: 100,
            port: 7471,
            duration_ms: 1000,
            prepare_ms: 1000,
            tos: None,
            ack_timeout: None,
            queue_depth: 1,
            backlog: 8,
            reap_mode: ReapMode::Polling,
            durable_path: None,
            cm_timeout_ms: None,
            server_addr: "127.0.0.1".to_owned(),
            bind_addr: None,
        }
    }
}

impl BenchConfig {
    /// Address and route resolution timeout passed to the connection manager.
    pub const RESOLVE_TIMEOUT_MS: u32 = 2000;

    /// Load the `[rwbench]` table of a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, BenchError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse the `[rwbench]` table of a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, BenchError> {
        let toml: toml::Value =
            toml::from_str(text).map_err(|e| BenchError::Config(e.to_string()))?;
        let table = toml
            .get("rwbench")
            .ok_or_else(|| BenchError::Config("rwbench configuration not found".to_owned()))?;
        let config: Self = table
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| BenchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document with a `[rwbench]` table.
    pub fn to_toml_string(&self) -> Result<String, BenchError> {
        #[derive(Serialize)]
        struct Doc<'a> {
            rwbench: &'a BenchConfig,
        }
        toml::to_string(&Doc { rwbench: self }).map_err(|e| BenchError::Config(e.to_string()))
    }

    /// Check the configuration for values no run can use.
    pub fn validate(&self) -> Result<(), BenchError> {
        let bad = |msg: &str| Err(BenchError::Config(msg.to_owned()));
        if self.connections == 0 {
            return bad("at least one connection is required");
        }
        if self.message_size == 0 || self.message_size > u32::MAX as usize {
            return bad("message size must be in 1..=u32::MAX");
        }
        if self.queue_depth == 0 {
            return bad("queue depth must be at least 1");
        }
        if self.backlog <= 0 {
            return bad("listen backlog must be positive");
        }
        if self.ack_timeout.is_some_and(|t| t > 31) {
            return bad("ack timeout must be in 0..=31");
        }
        if self.duration_ms == 0 {
            return bad("benchmark duration must be positive");
        }
        Ok(())
    }

    /// Length of the measurement window.
    #[inline]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Delay before the start gate opens.
    #[inline]
    pub fn prepare(&self) -> Duration {
        Duration::from_millis(self.prepare_ms)
    }

    /// Bound on connection manager event waits, if any.
    #[inline]
    pub fn cm_timeout(&self) -> Option<Duration> {
        self.cm_timeout_ms.map(Duration::from_millis)
    }

    /// Bytes a durable file must hold for this run.
    #[inline]
    pub fn durable_len(&self) -> usize {
        self.connections * self.message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_command_line_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.connections, 1);
        assert_eq!(config.message_size, 100);
        assert_eq!(config.port, 7471);
        assert_eq!(config.duration(), Duration::from_secs(1));
        assert_eq!(config.prepare(), Duration::from_secs(1));
        assert_eq!(config.backlog, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_table() {
        let config = BenchConfig::from_toml_str(
            r#"
            [rwbench]
            connections = 4
            message_size = 4096
            reap_mode = "blocking"
            durable_path = "/mnt/pmem0/rwbench"
            "#,
        )
        .unwrap();
        assert_eq!(config.connections, 4);
        assert_eq!(config.message_size, 4096);
        assert_eq!(config.reap_mode, ReapMode::Blocking);
        assert_eq!(config.durable_path, Some(PathBuf::from("/mnt/pmem0/rwbench")));
        assert_eq!(config.port, 7471);
        assert_eq!(config.durable_len(), 4 * 4096);
    }

    #[test]
    fn toml_roundtrip() {
        let config = BenchConfig {
            connections: 3,
            tos: Some(32),
            ack_timeout: Some(14),
            cm_timeout_ms: Some(500),
            bind_addr: Some("10.0.0.2".to_owned()),
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(BenchConfig::from_toml_str(&text).unwrap(), config);

        let path = std::env::temp_dir().join(format!("rwbench-config-{}.toml", std::process::id()));
        fs::write(&path, &text).unwrap();
        assert_eq!(BenchConfig::load_toml(&path).unwrap(), config);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            BenchConfig::from_toml_str("[other]\nx = 1"),
            Err(BenchError::Config(_))
        ));
        assert!(BenchConfig::from_toml_str("[rwbench]\nqueue_depth = 0").is_err());
        assert!(BenchConfig::from_toml_str("[rwbench]\nconnections = 0").is_err());
        assert!(BenchConfig::from_toml_str("[rwbench]\nack_timeout = 32").is_err());
        assert!(BenchConfig::from_toml_str("[rwbench]\nbogus = true").is_err());
    }
}

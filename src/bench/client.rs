use super::addr::ResolvedAddrs;
use super::config::BenchConfig;
use super::endpoint::{Endpoint, Quota};
use super::error::BenchError;
use super::stats::{aggregate, BenchReport, WorkerStats};
use super::worker::{run_workers, WorkerJob};
use crate::rdma::fabric::Fabric;

/// Active side: connects, learns the server's descriptors, and drives one
/// worker per connection.
pub struct Client {
    endpoint: Endpoint,
    addrs: ResolvedAddrs,
}

impl Client {
    pub fn new(fabric: &Fabric, config: &BenchConfig, addrs: ResolvedAddrs) -> Result<Self, BenchError> {
        Ok(Self {
            endpoint: Endpoint::initiator(fabric, config)?,
            addrs,
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Establish the configured connections. Return how many succeeded.
    pub fn connect(&mut self) -> Result<usize, BenchError> {
        log::info!("rwbench: connecting to {}", self.addrs.dst);
        self.endpoint.connect_all(self.addrs.src, self.addrs.dst)?;
        self.endpoint.run_until(Quota::Connects)?;
        let established = self.endpoint.arena().established().count();
        if established < self.endpoint.config().connections {
            log::warn!(
                "rwbench: {} of {} connection(s) established",
                established,
                self.endpoint.config().connections
            );
        }
        Ok(established)
    }

    /// Receive the descriptor of every established connection. Return how
    /// many were received.
    pub fn exchange(&mut self) -> usize {
        self.endpoint.exchange()
    }

    /// Worker jobs of the connections ready for benchmarking.
    pub fn jobs(&self) -> Vec<WorkerJob<'_>> {
        let engine = self.endpoint.engine();
        self.endpoint
            .arena()
            .established()
            .filter_map(|conn| WorkerJob::new(conn, engine).ok())
            .collect()
    }

    /// Run `jobs` for the configured prepare delay and duration.
    pub fn benchmark(&self, jobs: Vec<WorkerJob<'_>>) -> Vec<WorkerStats> {
        let config = self.endpoint.config();
        run_workers(
            jobs,
            self.endpoint.context(),
            config.prepare(),
            config.duration(),
        )
    }

    /// Disconnect every established connection and wait for the
    /// disconnections to complete.
    pub fn disconnect(&mut self) -> Result<(), BenchError> {
        let asked = self.endpoint.disconnect_all();
        log::debug!("rwbench: disconnecting {} connection(s)", asked);
        self.endpoint.run_until(Quota::Disconnects)
    }

    /// Run every phase and aggregate the workers' statistics.
    pub fn run(&mut self) -> Result<BenchReport, BenchError> {
        self.connect()?;
        let exchanged = self.exchange();
        log::info!("rwbench: received {} descriptor(s)", exchanged);
        let stats = self.benchmark(self.jobs());
        self.disconnect()?;
        Ok(aggregate(&stats, self.endpoint.config().message_size))
    }

    /// Release every connection.
    pub fn shutdown(mut self) {
        self.endpoint.shutdown();
    }
}

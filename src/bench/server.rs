use std::net::SocketAddr;

use super::config::BenchConfig;
use super::endpoint::{Endpoint, Quota};
use super::error::BenchError;
use crate::rdma::fabric::Fabric;

/// What a server run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerSummary {
    /// Connections established.
    pub accepted: usize,
    /// Connections their descriptor was sent to.
    pub exchanged: usize,
    /// Errors recorded along the way.
    pub errors: usize,
}

/// Passive side: accepts connections, advertises one region per connection,
/// and waits for the clients to go away.
pub struct Server {
    endpoint: Endpoint,
}

impl Server {
    /// Listen on `addr`.
    pub fn bind(fabric: &Fabric, config: &BenchConfig, addr: SocketAddr) -> Result<Self, BenchError> {
        Ok(Self {
            endpoint: Endpoint::acceptor(fabric, config, addr)?,
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Address the server listens on.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.endpoint.listen_addr()
    }

    /// Accept connections until the configured count is reached. Each
    /// connection gets its descriptor as soon as it is established. Return
    /// the number of connections established.
    pub fn accept(&mut self) -> Result<usize, BenchError> {
        log::info!("rwbench: starting server");
        self.endpoint.run_until(Quota::Connects)?;
        log::info!(
            "rwbench: metadata sent to {} connection(s)",
            self.endpoint.exchanged()
        );
        Ok(self.endpoint.connected())
    }

    /// Wait until every established connection has gone away.
    pub fn wait_disconnects(&mut self) -> Result<(), BenchError> {
        self.endpoint.run_until(Quota::Disconnects)?;
        log::info!("rwbench: disconnected");
        Ok(())
    }

    /// What the server has done so far.
    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            accepted: self.endpoint.connected(),
            exchanged: self.endpoint.exchanged(),
            errors: self.endpoint.errors().len(),
        }
    }

    /// Accept, then wait for every disconnection.
    pub fn run(&mut self) -> Result<ServerSummary, BenchError> {
        self.accept()?;
        self.wait_disconnects()?;
        Ok(self.summary())
    }

    /// Release every connection and the listener.
    pub fn shutdown(mut self) {
        self.endpoint.shutdown();
    }
}

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use super::config::BenchConfig;
use super::conn::{ConnArena, ConnRegions, Connection};
use super::context::BenchContext;
use super::engine::CompletionEngine;
use super::error::BenchError;
use super::resources::{ResourceOpts, ResourceSet};
use crate::ctrl::{ConnEvent, ConnState, Connecter, Role, DESCRIPTOR_LEN};
use crate::rdma::cm::{CmError, CmEvent, CmEventType, CmId, ConnParam, EventChannel, PortSpace};
use crate::rdma::fabric::Fabric;
use crate::rdma::mr::Permission;
use crate::wrap::{Backing, DurableFile};

/// Which counter a call to [`Endpoint::run_until`] drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// Run until every connection is established or has failed.
    Connects,
    /// Run until every established connection has gone away.
    Disconnects,
}

/// One side of a benchmark: its event channel, its connections, and the
/// single-threaded loop that drives them.
pub struct Endpoint {
    role: Role,
    config: BenchConfig,
    engine: CompletionEngine,
    ctx: Arc<BenchContext>,
    arena: ConnArena,
    listener: Option<CmId>,
    durable: Option<Arc<DurableFile>>,
    errors: Vec<(Option<usize>, BenchError)>,
    connected: usize,
    exchanged: usize,
    fabric: Fabric,
    // Declared last so identities never outlive the channel they report to.
    channel: EventChannel,
}

impl Endpoint {
    fn new(fabric: &Fabric, config: &BenchConfig, role: Role) -> Result<Self, BenchError> {
        config.validate()?;
        Ok(Self {
            role,
            config: config.clone(),
            engine: CompletionEngine::new(config.reap_mode),
            ctx: Arc::new(BenchContext::new(config.connections)),
            arena: ConnArena::with_capacity(config.connections),
            listener: None,
            durable: None,
            errors: Vec::new(),
            connected: 0,
            exchanged: 0,
            fabric: fabric.clone(),
            channel: EventChannel::open(fabric)?,
        })
    }

    /// Create an acceptor listening on `addr`.
    pub fn acceptor(
        fabric: &Fabric,
        config: &BenchConfig,
        addr: SocketAddr,
    ) -> Result<Self, BenchError> {
        let mut this = Self::new(fabric, config, Role::Acceptor)?;
        if let Some(path) = &config.durable_path {
            this.durable = Some(Arc::new(open_durable(path, config.durable_len())?));
        }

        let listener = CmId::new(fabric, &this.channel, PortSpace::Tcp)?;
        listener.bind_addr(addr)?;
        listener.listen(config.backlog)?;
        log::info!("rwbench: listening on {}", addr);
        this.listener = Some(listener);
        Ok(this)
    }

    /// Create an initiator. Connections are started with
    /// [`Endpoint::connect_all`].
    pub fn initiator(fabric: &Fabric, config: &BenchConfig) -> Result<Self, BenchError> {
        Self::new(fabric, config, Role::Initiator)
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    #[inline]
    pub fn engine(&self) -> CompletionEngine {
        self.engine
    }

    #[inline]
    pub fn context(&self) -> &Arc<BenchContext> {
        &self.ctx
    }

    #[inline]
    pub fn arena(&self) -> &ConnArena {
        &self.arena
    }

    #[inline]
    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    #[inline]
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Address the listener is bound to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.src_addr()
    }

    /// Errors recorded while dispatching events, with the index of the
    /// connection they concern.
    #[inline]
    pub fn errors(&self) -> &[(Option<usize>, BenchError)] {
        &self.errors
    }

    /// Connections that reached the established state so far.
    #[inline]
    pub fn connected(&self) -> usize {
        self.connected
    }

    /// Connections whose descriptor was published (acceptor) or received
    /// (initiator) so far.
    #[inline]
    pub fn exchanged(&self) -> usize {
        self.exchanged
    }

    fn record(&mut self, conn: Option<usize>, err: BenchError) {
        match conn {
            Some(idx) => log::error!("rwbench: connection {}: {}", idx, err),
            None => log::error!("rwbench: {}", err),
        }
        self.errors.push((conn, err));
    }

    /// Start one connection per configured connection towards `dst`.
    pub fn connect_all(&mut self, src: Option<SocketAddr>, dst: SocketAddr) -> Result<(), BenchError> {
        for _ in 0..self.config.connections {
            let id = CmId::new(&self.fabric, &self.channel, PortSpace::Tcp)?;
            let idx = self.arena.insert(id.clone(), Role::Initiator);
            if let Some(conn) = self.arena.get_mut(idx) {
                conn.start_resolving();
            }
            if let Err(e) = id.resolve_addr(src, dst, BenchConfig::RESOLVE_TIMEOUT_MS) {
                self.fail(idx);
                self.record(Some(idx), e.into());
            }
        }
        Ok(())
    }

    /// Handle events until `quota` reaches zero. Every event is acknowledged
    /// exactly once.
    pub fn run_until(&mut self, quota: Quota) -> Result<(), BenchError> {
        while self.left(quota) > 0 {
            let event = match self.config.cm_timeout() {
                Some(timeout) => self.channel.get_event_timeout(timeout),
                None => self.channel.get_event(),
            };
            let event = match event {
                Ok(event) => event,
                Err(e) if e.raw_os_error() == Some(libc::ETIMEDOUT) => {
                    return Err(BenchError::Timeout("connection manager event"));
                }
                Err(e) => return Err(e.into()),
            };

            self.dispatch(&event);
            if let Err(e) = event.ack() {
                log::warn!("rwbench: cannot ack event: {}", e);
            }
        }
        Ok(())
    }

    fn left(&self, quota: Quota) -> usize {
        match quota {
            Quota::Connects => self.ctx.connects_left(),
            Quota::Disconnects => self.ctx.disconnects_left(),
        }
    }

    fn dispatch(&mut self, event: &CmEvent) {
        let kind = event.event_type();
        let status = event.status();
        log::debug!(
            "rwbench: event {} on {} (status {})",
            kind,
            event.id().handle(),
            status
        );

        if kind == CmEventType::ConnectRequest {
            if status != 0 {
                if let Err(e) = event.id().reject() {
                    log::debug!("rwbench: reject of a faulted request: {}", e);
                }
                self.record(None, BenchError::ConnectionError { event: kind, status });
                return;
            }
            self.on_connect_request(event.id());
            return;
        }
        let Some(idx) = self.arena.lookup(event.id().handle()) else {
            self.on_foreign_event(event.id(), kind, status);
            return;
        };
        if let Err(e) = self.on_conn_event(idx, kind, status) {
            self.record(Some(idx), e);
        }
    }

    /// Events about identities outside the arena: the listener, or
    /// connection requests already turned away.
    fn on_foreign_event(&mut self, id: &CmId, kind: CmEventType, status: i32) {
        let is_listener = self.listener.as_ref().is_some_and(|l| l == id);
        if is_listener && kind == CmEventType::DeviceRemoval {
            // No more requests can arrive.
            let pending = self.ctx.connects_left();
            for _ in 0..pending {
                self.ctx.connect_failed();
            }
            self.record(None, BenchError::ConnectionError { event: kind, status });
            return;
        }
        log::debug!("rwbench: ignoring {} on unknown {}", kind, id.handle());
    }

    fn on_connect_request(&mut self, id: &CmId) {
        if self.arena.len() >= self.ctx.connections() {
            log::info!(
                "rwbench: rejecting connection request, {} connections already",
                self.arena.len()
            );
            if let Err(e) = id.reject() {
                self.record(None, e.into());
            }
            return;
        }

        let idx = self.arena.insert(id.clone(), Role::Acceptor);
        if let Some(conn) = self.arena.get_mut(idx) {
            conn.on_event(&ConnEvent::ConnectRequest);
        }
        let accepted = self
            .setup(idx)
            .and_then(|()| id.accept(&ConnParam::default()).map_err(Into::into));
        if let Err(e) = accepted {
            self.fail(idx);
            if let Err(e) = id.reject() {
                log::debug!("rwbench: reject after failed accept: {}", e);
            }
            self.record(Some(idx), e);
        }
    }

    fn on_conn_event(&mut self, idx: usize, kind: CmEventType, status: i32) -> Result<(), BenchError> {
        let event = ConnEvent::from_cm(kind, status);
        let conn = self
            .arena
            .get_mut(idx)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let prev = conn.state();
        let Some(next) = conn.on_event(&event) else {
            log::debug!(
                "rwbench: connection {} ignores {} in state {}",
                idx,
                kind,
                prev
            );
            return Ok(());
        };

        if next == ConnState::Failed {
            self.settle_failure(idx, prev);
            return Err(BenchError::ConnectionError { event: kind, status });
        }

        let acted = match event {
            ConnEvent::AddrResolved => self.on_addr_resolved(idx),
            ConnEvent::RouteResolved => self.on_route_resolved(idx),
            ConnEvent::Established => {
                self.ctx.connect_done();
                self.connected += 1;
                log::info!("rwbench: connection {} established", idx);
                // The initiator posted its descriptor receive before
                // connecting, so the acceptor can publish right away.
                if self.role == Role::Acceptor {
                    if let Err(e) = self.exchange_one(idx) {
                        self.abandon(idx, e);
                    }
                }
                Ok(())
            }
            ConnEvent::Disconnected => {
                self.ctx.disconnect_done();
                if let Some(conn) = self.arena.get_mut(idx) {
                    if let Some(data) = conn.data().filter(|d| d.is_durable()) {
                        if let Err(e) = data.persist() {
                            log::warn!("rwbench: connection {} cannot persist: {}", idx, e);
                        }
                    }
                    conn.release();
                }
                log::info!("rwbench: connection {} closed", idx);
                Ok(())
            }
            _ => Ok(()),
        };
        if acted.is_err() {
            self.fail(idx);
        }
        acted
    }

    fn on_addr_resolved(&mut self, idx: usize) -> Result<(), BenchError> {
        let conn = self.conn(idx)?;
        let id = conn.id();
        if let Some(tos) = self.config.tos {
            id.set_tos(tos)?;
        }
        if let Some(timeout) = self.config.ack_timeout {
            id.set_ack_timeout(timeout)?;
        }
        id.resolve_route(BenchConfig::RESOLVE_TIMEOUT_MS)?;
        Ok(())
    }

    fn on_route_resolved(&mut self, idx: usize) -> Result<(), BenchError> {
        self.setup(idx)?;
        let conn = self.conn(idx)?;
        let (Some(qp), Some(meta)) = (conn.qp(), conn.meta()) else {
            return Err(CmError::NoQp.into());
        };
        // The descriptor is sent right after establishment, so the receive
        // must be posted before connecting.
        Connecter::new(qp, meta)?.post_descriptor_recv()?;
        conn.id().connect(&ConnParam::default())?;
        Ok(())
    }

    /// Allocate and register the resources of connection `idx`.
    fn setup(&mut self, idx: usize) -> Result<(), BenchError> {
        let opts = ResourceOpts {
            depth: self.config.queue_depth,
            reap_mode: self.config.reap_mode,
        };
        let size = self.config.message_size;
        let durable = self.durable.clone();
        let role = self.role;

        let conn = self
            .arena
            .get_mut(idx)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let mut res = ResourceSet::allocate(conn.id(), &opts)?;
        let meta = res.register(Backing::Heap { len: DESCRIPTOR_LEN }, Permission::LOCAL_WRITE)?;
        let regions = match role {
            Role::Acceptor => {
                let backing = match durable {
                    Some(file) => Backing::Durable {
                        file,
                        offset: idx * size,
                        len: size,
                    },
                    None => Backing::Heap { len: size },
                };
                let data = res.register(backing, Permission::default())?;
                ConnRegions {
                    meta,
                    data,
                    sink: None,
                }
            }
            Role::Initiator => {
                let data = res.register(Backing::Heap { len: size }, Permission::LOCAL_WRITE)?;
                let sink = res.register(Backing::Heap { len: size }, Permission::LOCAL_WRITE)?;
                if let Some(src) = res.region(data) {
                    src.fill(fill_byte(idx));
                }
                ConnRegions {
                    meta,
                    data,
                    sink: Some(sink),
                }
            }
        };
        conn.attach(res, regions);
        Ok(())
    }

    fn conn(&self, idx: usize) -> Result<&Connection, BenchError> {
        self.arena
            .get(idx)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound).into())
    }

    /// Account for the failure of connection `idx` coming from `prev`.
    fn settle_failure(&mut self, idx: usize, prev: ConnState) {
        match prev {
            ConnState::Established | ConnState::Disconnecting => self.ctx.disconnect_done(),
            ConnState::Closed | ConnState::Failed => {}
            _ => self.ctx.connect_failed(),
        }
        if let Some(conn) = self.arena.get_mut(idx) {
            conn.fail();
        }
    }

    /// Fail connection `idx` by a local decision.
    fn fail(&mut self, idx: usize) {
        let Some(conn) = self.arena.get(idx) else {
            return;
        };
        let prev = conn.state();
        if prev.is_terminal() {
            return;
        }
        self.settle_failure(idx, prev);
    }

    /// Run the descriptor exchange on every established connection that has
    /// not done it yet. An acceptor publishes as each connection is
    /// established, so this only waits on the initiator side. A connection
    /// whose exchange fails is disconnected and failed. Return the number of
    /// connections that completed the exchange in this call.
    pub fn exchange(&mut self) -> usize {
        let pending: Vec<_> = self
            .arena
            .established()
            .filter(|c| c.remote().is_none())
            .map(Connection::index)
            .collect();
        let mut done = 0;
        for idx in pending {
            match self.exchange_one(idx) {
                Ok(()) => done += 1,
                Err(e) => self.abandon(idx, e),
            }
        }
        done
    }

    /// Disconnect and fail connection `idx` after `err`.
    fn abandon(&mut self, idx: usize, err: BenchError) {
        if let Some(conn) = self.arena.get(idx) {
            if let Err(e) = conn.id().disconnect() {
                log::debug!("rwbench: disconnect after failed exchange: {}", e);
            }
        }
        self.fail(idx);
        self.record(Some(idx), err);
    }

    fn exchange_one(&mut self, idx: usize) -> Result<(), BenchError> {
        let engine = self.engine;
        let size = self.config.message_size;
        let conn = self.conn(idx)?;
        let (Some(qp), Some(meta), Some(data)) = (conn.qp(), conn.meta(), conn.data()) else {
            return Err(CmError::NoQp.into());
        };
        let connecter = Connecter::new(qp, meta)?;
        let remote = match self.role {
            Role::Acceptor => {
                let published = connecter.publish_descriptor(data)?;
                engine.reap(qp.scq(), 1)?;
                published
            }
            Role::Initiator => {
                let wcs = engine.reap(qp.rcq(), 1)?;
                connecter.recv(&wcs[0], size)?
            }
        };
        log::debug!(
            "rwbench: connection {} descriptor {:#x}+{} rkey={:#x}",
            idx,
            remote.addr,
            remote.len,
            remote.rkey
        );
        if let Some(conn) = self.arena.get_mut(idx) {
            conn.set_remote(remote);
        }
        self.exchanged += 1;
        Ok(())
    }

    /// Disconnect every established connection. Return how many were asked
    /// to disconnect.
    pub fn disconnect_all(&mut self) -> usize {
        let mut asked = 0;
        let mut failed = Vec::new();
        for conn in self.arena.iter_mut() {
            if !conn.start_disconnect() {
                continue;
            }
            match conn.id().disconnect() {
                Ok(()) => asked += 1,
                Err(e) => failed.push((conn.index(), e)),
            }
        }
        for (idx, e) in failed {
            self.fail(idx);
            self.record(Some(idx), e.into());
        }
        asked
    }

    /// Release every connection's resources, then the identities and the
    /// listener. Safe to call more than once.
    pub fn shutdown(&mut self) {
        for conn in self.arena.iter_mut() {
            conn.release();
        }
        self.arena = ConnArena::default();
        self.listener = None;
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pattern of the write source of connection `idx`.
pub(crate) fn fill_byte(idx: usize) -> u8 {
    b'A' + (idx % 26) as u8
}

fn open_durable(path: &std::path::Path, len: usize) -> Result<DurableFile, BenchError> {
    let file = match DurableFile::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => DurableFile::create(path, len)?,
        Err(e) => return Err(e.into()),
    };
    if file.len() < len {
        return Err(BenchError::Config(format!(
            "durable file {} holds {} bytes, {} needed",
            path.display(),
            file.len(),
            len
        )));
    }
    log::info!("rwbench: durable memory {} ({} bytes)", path.display(), file.len());
    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::rdma::context::DeviceAttr;

    fn config(connections: usize) -> BenchConfig {
        BenchConfig {
            connections,
            message_size: 64,
            cm_timeout_ms: Some(5000),
            ..Default::default()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn connect_exchange_disconnect() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let cfg = config(2);
        let mut server = Endpoint::acceptor(&fabric, &cfg, addr(7471)).unwrap();
        let mut client = Endpoint::initiator(&fabric, &cfg).unwrap();

        thread::scope(|s| {
            let srv = s.spawn(|| {
                server.run_until(Quota::Connects).unwrap();
                assert_eq!(server.connected(), 2);
                assert_eq!(server.exchanged(), 2);
                assert_eq!(server.exchange(), 0);
                server.run_until(Quota::Disconnects).unwrap();
            });

            client.connect_all(None, addr(7471)).unwrap();
            client.run_until(Quota::Connects).unwrap();
            assert_eq!(client.arena().established().count(), 2);
            assert_eq!(client.exchange(), 2);
            assert_eq!(client.exchange(), 0);
            assert_eq!(client.exchanged(), 2);
            for conn in client.arena().iter() {
                let remote = conn.remote().unwrap();
                assert_eq!(remote.len, 64);
            }
            assert_eq!(client.disconnect_all(), 2);
            client.run_until(Quota::Disconnects).unwrap();
            srv.join().unwrap();
        });

        assert!(client.errors().is_empty());
        assert!(server.errors().is_empty());
        assert_eq!(client.channel().unacked(), 0);
        assert_eq!(server.channel().unacked(), 0);
        assert!(client
            .arena()
            .iter()
            .all(|c| c.state() == ConnState::Closed && c.resources().is_none()));
        drop((client, server));
        assert!(fabric.context().unwrap().usage().is_empty());
    }

    #[test]
    fn no_listener_fails_every_connection() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let mut client = Endpoint::initiator(&fabric, &config(3)).unwrap();
        client.connect_all(None, addr(9)).unwrap();
        client.run_until(Quota::Connects).unwrap();

        assert_eq!(client.context().disconnects_left(), 0);
        assert_eq!(client.errors().len(), 3);
        assert!(client.errors().iter().all(|(_, e)| matches!(
            e,
            BenchError::ConnectionError { event: CmEventType::Unreachable, .. }
        )));
        assert!(client.arena().iter().all(|c| c.state() == ConnState::Failed));
        assert_eq!(client.channel().unacked(), 0);
    }

    #[test]
    fn timeout_bounds_the_loop() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let cfg = BenchConfig {
            cm_timeout_ms: Some(20),
            ..config(1)
        };
        let mut server = Endpoint::acceptor(&fabric, &cfg, addr(7000)).unwrap();
        assert!(matches!(
            server.run_until(Quota::Connects),
            Err(BenchError::Timeout(_))
        ));
        assert_eq!(server.listen_addr(), Some(addr(7000)));
    }

    #[test]
    fn listener_removal_ends_the_connect_phase() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let mut server = Endpoint::acceptor(&fabric, &config(2), addr(7001)).unwrap();
        fabric.remove_device();
        server.run_until(Quota::Connects).unwrap();
        assert!(matches!(
            server.errors(),
            [(None, BenchError::ConnectionError { event: CmEventType::DeviceRemoval, .. })]
        ));
    }
}

//! Connection manager: identities, events, and the connection handshake.

mod event;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::{fmt, io};

use thiserror::Error;

use self::event::{EventChannelInner, RawEvent, Subject};
pub use self::event::{CmEvent, CmEventType, EventChannel};
use super::context::Context;
use super::fabric::Fabric;
use super::pd::Pd;
use super::qp::{Qp, QpBuilder, QpCreationError};
#[cfg(feature = "verbs")]
use super::verbs::RawCmId;
#[cfg(feature = "verbs")]
use crate::bindings::{RDMA_OPTION_ID_ACK_TIMEOUT, RDMA_OPTION_ID_TOS};
use crate::utils::interop::from_errno;
use crate::utils::sync::lock;

/// Reason code carried by `Rejected` events caused by the peer's explicit
/// reject (`IB_CM_REJ_CONSUMER_DEFINED`).
pub const REJECT_CONSUMER_DEFINED: i32 = 28;

/// Connection manager error type.
#[derive(Debug, Error)]
pub enum CmError {
    /// The device or the fabric reported an error.
    #[error("I/O error from connection manager")]
    IoError(#[from] io::Error),

    /// The identity is not in a state that allows the operation.
    #[error("invalid identity state: {0}")]
    InvalidState(&'static str),

    /// The identity has no queue pair.
    #[error("no queue pair created on the identity")]
    NoQp,

    /// Queue pair creation failed.
    #[error("cannot create queue pair")]
    QpCreation(#[from] QpCreationError),
}

/// Port space of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortSpace {
    /// Reliable connected, TCP-like port space (`RDMA_PS_TCP`).
    #[default]
    Tcp,
}

/// Connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParam {
    /// Maximum outstanding RDMA reads/atomics the local side accepts.
    pub responder_resources: u8,
    /// Maximum outstanding RDMA reads/atomics the local side issues.
    pub initiator_depth: u8,
    /// Transport retry count, 0..=7.
    pub retry_count: u8,
    /// RNR retry count, 0..=7.
    pub rnr_retry_count: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 5,
            rnr_retry_count: 0,
        }
    }
}

impl ConnParam {
    fn validate(&self) -> Result<(), CmError> {
        if self.retry_count > 7 || self.rnr_retry_count > 7 {
            return Err(from_errno(libc::EINVAL).into());
        }
        Ok(())
    }
}

/// Stable identifier of a connection manager identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmIdHandle(pub(crate) u64);

impl fmt::Display for CmIdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cm#{}", self.0)
    }
}

#[derive(Default)]
struct CmIdState {
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    addr_resolved: bool,
    route_resolved: bool,
    listening: Option<SocketAddr>,
    tos: Option<u8>,
    ack_timeout: Option<u8>,
    qp: Option<Qp>,
    peer: Option<Weak<CmIdInner>>,
    /// Incoming request not yet accepted or rejected.
    request_pending: bool,
    connecting: bool,
    connected: bool,
    disconnected: bool,
}

pub(crate) struct CmIdInner {
    #[cfg(feature = "verbs")]
    raw: Option<Arc<RawCmId>>,
    handle: CmIdHandle,
    fabric: Fabric,
    channel: Weak<EventChannelInner>,
    ps: PortSpace,
    state: Mutex<CmIdState>,
}

impl Drop for CmIdInner {
    fn drop(&mut self) {
        let this = self as *const CmIdInner;
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(addr) = state.listening {
            if self.fabric.is_soft() {
                self.fabric.remove_listener(addr, this);
            }
        }
        let peer = state.peer.take().and_then(|w| w.upgrade());
        let was_connected = state.connected && !state.disconnected;
        let was_connecting = state.connecting && !state.connected;
        if let Some(qp) = state.qp.take() {
            qp.set_error();
        }
        self.fabric.unregister(self.handle);

        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.raw {
            if state.request_pending {
                if let Err(e) = raw.reject() {
                    log::warn!("rwbench: cannot reject request of {}: {}", self.handle, e);
                }
            }
            log::trace!("rwbench: destroy {}", self.handle);
            return;
        }

        if let Some(peer) = peer.map(CmId::from_inner) {
            if was_connected {
                peer.remote_disconnect();
            } else if was_connecting || state.request_pending {
                peer.connect_failed(CmEventType::Rejected, REJECT_CONSUMER_DEFINED);
            }
        }
        log::trace!("rwbench: destroy {}", self.handle);
    }
}

/// Connection manager identity, the counterpart of `rdma_cm_id`.
///
/// This type is a simple wrapper of an `Arc`; the identity is destroyed when
/// the last clone is dropped. Destroying a connected identity disconnects it.
#[derive(Clone)]
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("CmId")
            .field("handle", &self.inner.handle)
            .field("src", &state.src)
            .field("dst", &state.dst)
            .field("connected", &state.connected)
            .finish()
    }
}

impl PartialEq for CmId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CmId {}

impl CmId {
    /// Create a new identity reporting to `channel`. Identities of a
    /// hardware fabric need a channel made by [`EventChannel::open`].
    pub fn new(fabric: &Fabric, channel: &EventChannel, ps: PortSpace) -> io::Result<Self> {
        fabric.check_alive()?;
        #[cfg(feature = "verbs")]
        if !fabric.is_soft() {
            let raw = channel.raw().ok_or_else(|| from_errno(libc::EINVAL))?;
            let raw = Arc::new(RawCmId::create(raw)?);
            return Ok(Self::create_hw(fabric, channel.downgrade(), ps, CmIdState::default(), raw));
        }
        Ok(Self::create(fabric, channel.downgrade(), ps, CmIdState::default()))
    }

    fn create(
        fabric: &Fabric,
        channel: Weak<EventChannelInner>,
        ps: PortSpace,
        state: CmIdState,
    ) -> Self {
        let handle = fabric.next_handle();
        let inner = Arc::new(CmIdInner {
            #[cfg(feature = "verbs")]
            raw: None,
            handle,
            fabric: fabric.clone(),
            channel,
            ps,
            state: Mutex::new(state),
        });
        fabric.register(handle, Arc::downgrade(&inner));
        log::trace!("rwbench: create {}", handle);
        Self { inner }
    }

    /// Wrap a librdmacm identity. Its handle is the identity's address, so
    /// events can be routed back to it.
    #[cfg(feature = "verbs")]
    fn create_hw(
        fabric: &Fabric,
        channel: Weak<EventChannelInner>,
        ps: PortSpace,
        state: CmIdState,
        raw: Arc<RawCmId>,
    ) -> Self {
        let handle = CmIdHandle(raw.as_ptr() as u64);
        let inner = Arc::new(CmIdInner {
            raw: Some(raw),
            handle,
            fabric: fabric.clone(),
            channel,
            ps,
            state: Mutex::new(state),
        });
        fabric.register(handle, Arc::downgrade(&inner));
        log::trace!("rwbench: create {}", handle);
        Self { inner }
    }

    #[cfg(feature = "verbs")]
    fn raw(&self) -> Option<&Arc<RawCmId>> {
        self.inner.raw.as_ref()
    }

    /// Track the connection state a librdmacm event implies.
    #[cfg(feature = "verbs")]
    pub(super) fn note_event(&self, kind: CmEventType) {
        let mut state = lock(&self.inner.state);
        match kind {
            CmEventType::AddrResolved => {
                state.addr_resolved = true;
                if let Some(raw) = self.raw() {
                    state.src = raw.local_addr().or(state.src);
                }
            }
            CmEventType::RouteResolved => state.route_resolved = true,
            CmEventType::Established => {
                state.connecting = false;
                state.connected = true;
            }
            CmEventType::Disconnected => state.disconnected = true,
            CmEventType::ConnectError | CmEventType::Unreachable | CmEventType::Rejected => {
                state.connecting = false;
            }
            _ => {}
        }
    }

    pub(crate) fn from_inner(inner: Arc<CmIdInner>) -> Self {
        Self { inner }
    }

    /// Get the stable handle of this identity.
    #[inline]
    pub fn handle(&self) -> CmIdHandle {
        self.inner.handle
    }

    /// Get the port space of this identity.
    #[inline]
    pub fn port_space(&self) -> PortSpace {
        self.inner.ps
    }

    /// Get the fabric this identity lives on.
    #[inline]
    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }

    /// Get the device context of this identity. On a hardware fabric the
    /// identity is bound to a device once its address is bound or resolved,
    /// and `ENODEV` is returned before that.
    pub fn context(&self) -> io::Result<Context> {
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            let verbs = raw.verbs();
            if verbs.is_null() {
                return Err(from_errno(libc::ENODEV));
            }
            return self.inner.fabric.open_device(verbs);
        }
        self.inner
            .fabric
            .context()
            .cloned()
            .ok_or_else(|| from_errno(libc::ENODEV))
    }

    /// Get the event channel of this identity, if it is still open.
    pub fn channel(&self) -> Option<EventChannel> {
        self.inner.channel.upgrade().map(EventChannel::from_inner)
    }

    /// Get the local address.
    pub fn src_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state).src
    }

    /// Get the peer address.
    pub fn dst_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state).dst
    }

    /// Get the configured type of service.
    pub fn tos(&self) -> Option<u8> {
        lock(&self.inner.state).tos
    }

    /// Get the configured ack timeout exponent.
    pub fn ack_timeout(&self) -> Option<u8> {
        lock(&self.inner.state).ack_timeout
    }

    /// Get the queue pair of this identity.
    pub fn qp(&self) -> Option<Qp> {
        lock(&self.inner.state).qp.clone()
    }

    /// Whether the connection is currently established.
    pub fn is_connected(&self) -> bool {
        let state = lock(&self.inner.state);
        state.connected && !state.disconnected
    }

    /// Queue an event about this identity on its channel. Dropped if the
    /// channel has been closed.
    pub(crate) fn raise(&self, kind: CmEventType, status: i32) {
        self.raise_with(kind, status, Subject::Id(Arc::downgrade(&self.inner)), None, None);
    }

    fn raise_with(
        &self,
        kind: CmEventType,
        status: i32,
        subject: Subject,
        listen_id: Option<Weak<CmIdInner>>,
        param: Option<ConnParam>,
    ) {
        log::trace!("rwbench: {} <- {} ({})", self.inner.handle, kind, status);
        match self.inner.channel.upgrade() {
            Some(channel) => channel.push(RawEvent {
                kind,
                status,
                subject,
                listen_id,
                param,
            }),
            None => log::debug!(
                "rwbench: {} dropped for {}, channel closed",
                kind,
                self.inner.handle
            ),
        }
    }

    fn peer(&self) -> Option<CmId> {
        lock(&self.inner.state)
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .map(CmId::from_inner)
    }

    /// Bind to a local address.
    pub fn bind_addr(&self, addr: SocketAddr) -> Result<(), CmError> {
        self.inner.fabric.check_alive()?;
        let mut state = lock(&self.inner.state);
        if state.listening.is_some() || state.connecting || state.connected {
            return Err(CmError::InvalidState("already in use"));
        }
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            raw.bind_addr(&addr)?;
        }
        state.src = Some(addr);
        Ok(())
    }

    /// Start listening for connection requests on the bound address.
    pub fn listen(&self, backlog: i32) -> Result<(), CmError> {
        self.inner.fabric.check_alive()?;
        if backlog <= 0 {
            return Err(from_errno(libc::EINVAL).into());
        }
        let mut state = lock(&self.inner.state);
        let addr = state.src.ok_or(CmError::InvalidState("not bound"))?;
        if state.listening.is_some() {
            return Ok(());
        }
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            raw.listen(backlog)?;
            state.listening = Some(addr);
            log::debug!("rwbench: {} listening on {}", self.inner.handle, addr);
            return Ok(());
        }
        self.inner
            .fabric
            .add_listener(addr, Arc::downgrade(&self.inner))?;
        state.listening = Some(addr);
        log::debug!("rwbench: {} listening on {} (backlog {})", self.inner.handle, addr, backlog);
        Ok(())
    }

    /// Resolve the destination address. The result is reported with an
    /// `AddrResolved` or `AddrError` event.
    pub fn resolve_addr(
        &self,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        timeout_ms: u32,
    ) -> Result<(), CmError> {
        self.inner.fabric.check_alive()?;
        log::trace!(
            "rwbench: {} resolving {} (timeout {} ms)",
            self.inner.handle,
            dst,
            timeout_ms
        );
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            let mut state = lock(&self.inner.state);
            if state.connecting || state.connected {
                return Err(CmError::InvalidState("already connecting"));
            }
            raw.resolve_addr(src.as_ref(), &dst, timeout_ms)?;
            state.src = src.or(state.src);
            state.dst = Some(dst);
            return Ok(());
        }
        if dst.ip().is_unspecified() || dst.port() == 0 {
            self.raise(CmEventType::AddrError, -libc::EADDRNOTAVAIL);
            return Ok(());
        }

        {
            let mut state = lock(&self.inner.state);
            if state.connecting || state.connected {
                return Err(CmError::InvalidState("already connecting"));
            }
            let src = src.or(state.src).unwrap_or_else(|| {
                let ip = if dst.ip().is_loopback() {
                    dst.ip()
                } else {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                };
                SocketAddr::new(ip, 0)
            });
            let src = if src.port() == 0 {
                SocketAddr::new(src.ip(), self.inner.fabric.ephemeral_port())
            } else {
                src
            };
            state.src = Some(src);
            state.dst = Some(dst);
            state.addr_resolved = true;
        }
        self.raise(CmEventType::AddrResolved, 0);
        Ok(())
    }

    /// Resolve the route to the destination. The result is reported with a
    /// `RouteResolved` event.
    pub fn resolve_route(&self, timeout_ms: u32) -> Result<(), CmError> {
        self.inner.fabric.check_alive()?;
        {
            let mut state = lock(&self.inner.state);
            if !state.addr_resolved {
                return Err(CmError::InvalidState("address not resolved"));
            }
            #[cfg(feature = "verbs")]
            if let Some(raw) = self.raw() {
                raw.resolve_route(timeout_ms)?;
                return Ok(());
            }
            state.route_resolved = true;
        }
        log::trace!(
            "rwbench: {} route resolved (timeout {} ms)",
            self.inner.handle,
            timeout_ms
        );
        self.raise(CmEventType::RouteResolved, 0);
        Ok(())
    }

    /// Set the type of service of outgoing traffic.
    pub fn set_tos(&self, tos: u8) -> Result<(), CmError> {
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            raw.set_option_u8(RDMA_OPTION_ID_TOS, tos)?;
        }
        lock(&self.inner.state).tos = Some(tos);
        Ok(())
    }

    /// Set the local ack timeout exponent (4.096 µs × 2^timeout), 0..=31.
    pub fn set_ack_timeout(&self, timeout: u8) -> Result<(), CmError> {
        if timeout > 31 {
            return Err(from_errno(libc::EINVAL).into());
        }
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            raw.set_option_u8(RDMA_OPTION_ID_ACK_TIMEOUT, timeout)?;
        }
        lock(&self.inner.state).ack_timeout = Some(timeout);
        Ok(())
    }

    /// Create the queue pair of this identity in `pd`. The queue pair is
    /// moved to `Init`, so receives can be posted right away.
    pub fn create_qp(&self, pd: &Pd, builder: QpBuilder) -> Result<Qp, CmError> {
        let mut state = lock(&self.inner.state);
        if state.qp.is_some() {
            return Err(from_errno(libc::EEXIST).into());
        }
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            let qp = Qp::new_on_id(pd, builder, raw)?;
            state.qp = Some(qp.clone());
            return Ok(qp);
        }
        let qp = builder.build(pd)?;
        qp.init();
        state.qp = Some(qp.clone());
        Ok(qp)
    }

    /// Destroy the queue pair of this identity. No-op if there is none.
    pub fn destroy_qp(&self) {
        let qp = lock(&self.inner.state).qp.take();
        if let Some(qp) = qp {
            qp.set_error();
        }
    }

    /// Send a connection request to the resolved destination.
    ///
    /// The request is reported to the listener with a `ConnectRequest`
    /// event; an unreachable destination is reported locally with an
    /// `Unreachable` event.
    pub fn connect(&self, param: &ConnParam) -> Result<(), CmError> {
        self.inner.fabric.check_alive()?;
        param.validate()?;
        let (src, dst) = {
            let mut state = lock(&self.inner.state);
            if !state.route_resolved {
                return Err(CmError::InvalidState("route not resolved"));
            }
            if state.qp.is_none() {
                return Err(CmError::NoQp);
            }
            if state.connecting || state.connected {
                return Err(CmError::InvalidState("already connecting"));
            }
            #[cfg(feature = "verbs")]
            if let Some(raw) = self.raw() {
                raw.connect(param)?;
                state.connecting = true;
                return Ok(());
            }
            state.connecting = true;
            (state.src, state.dst)
        };
        let Some(dst) = dst else {
            return Err(CmError::InvalidState("address not resolved"));
        };

        let listener = self
            .inner
            .fabric
            .find_listener(dst)
            .filter(|l| l.inner.channel.strong_count() > 0);
        let Some(listener) = listener else {
            log::debug!("rwbench: {} no listener on {}", self.inner.handle, dst);
            self.connect_failed(CmEventType::Unreachable, -libc::ECONNREFUSED);
            return Ok(());
        };

        let child = CmId::create(
            &self.inner.fabric,
            listener.inner.channel.clone(),
            listener.inner.ps,
            CmIdState {
                src: Some(dst),
                dst: src,
                addr_resolved: true,
                route_resolved: true,
                peer: Some(Arc::downgrade(&self.inner)),
                request_pending: true,
                ..Default::default()
            },
        );
        lock(&self.inner.state).peer = Some(Arc::downgrade(&child.inner));
        log::debug!(
            "rwbench: {} -> {} connection request as {}",
            self.inner.handle,
            dst,
            child.handle()
        );
        listener.raise_with(
            CmEventType::ConnectRequest,
            0,
            Subject::Owned(child),
            Some(Arc::downgrade(&listener.inner)),
            Some(*param),
        );
        Ok(())
    }

    /// Report a failed connection attempt on an initiating identity.
    fn connect_failed(&self, kind: CmEventType, status: i32) {
        {
            let mut state = lock(&self.inner.state);
            if !state.connecting || state.connected {
                return;
            }
            state.connecting = false;
            state.peer = None;
        }
        self.raise(kind, status);
    }

    /// Accept a pending connection request. Both sides receive an
    /// `Established` event.
    pub fn accept(&self, param: &ConnParam) -> Result<(), CmError> {
        self.inner.fabric.check_alive()?;
        param.validate()?;
        let qp = {
            let state = lock(&self.inner.state);
            if !state.request_pending {
                return Err(CmError::InvalidState("no pending request"));
            }
            state.qp.clone().ok_or(CmError::NoQp)?
        };
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw() {
            raw.accept(param)?;
            let mut state = lock(&self.inner.state);
            state.request_pending = false;
            state.connecting = true;
            return Ok(());
        }
        let Some(peer) = self.peer() else {
            lock(&self.inner.state).request_pending = false;
            return Err(from_errno(libc::ECONNRESET).into());
        };
        let peer_qp = peer.qp().ok_or(CmError::NoQp)?;

        Qp::bind_peers(&qp, &peer_qp);
        for id in [self, &peer] {
            let mut state = lock(&id.inner.state);
            state.request_pending = false;
            state.connecting = false;
            state.connected = true;
        }
        self.raise(CmEventType::Established, 0);
        peer.raise(CmEventType::Established, 0);
        Ok(())
    }

    /// Reject a pending connection request. The initiator receives a
    /// `Rejected` event.
    pub fn reject(&self) -> Result<(), CmError> {
        let peer = {
            let mut state = lock(&self.inner.state);
            if !state.request_pending {
                return Err(CmError::InvalidState("no pending request"));
            }
            #[cfg(feature = "verbs")]
            if let Some(raw) = self.raw() {
                raw.reject()?;
                state.request_pending = false;
                return Ok(());
            }
            state.request_pending = false;
            state.peer.take().and_then(|w| w.upgrade())
        };
        if let Some(peer) = peer.map(CmId::from_inner) {
            peer.connect_failed(CmEventType::Rejected, REJECT_CONSUMER_DEFINED);
        }
        Ok(())
    }

    /// Disconnect an established connection. Both sides receive a
    /// `Disconnected` event and their queue pairs are flushed. Disconnecting
    /// an already disconnected identity is a no-op.
    pub fn disconnect(&self) -> Result<(), CmError> {
        let (qp, peer) = {
            let mut state = lock(&self.inner.state);
            if state.disconnected {
                return Ok(());
            }
            if !state.connected {
                return Err(CmError::InvalidState("not connected"));
            }
            #[cfg(feature = "verbs")]
            if let Some(raw) = self.raw() {
                // The local `Disconnected` event comes from librdmacm.
                raw.disconnect()?;
                state.disconnected = true;
                return Ok(());
            }
            state.disconnected = true;
            (state.qp.clone(), state.peer.take().and_then(|w| w.upgrade()))
        };
        if let Some(qp) = qp {
            qp.set_error();
        }
        self.raise(CmEventType::Disconnected, 0);
        if let Some(peer) = peer {
            CmId::from_inner(peer).remote_disconnect();
        }
        Ok(())
    }

    /// Handle the peer side going away.
    fn remote_disconnect(&self) {
        let qp = {
            let mut state = lock(&self.inner.state);
            if state.disconnected || !state.connected {
                return;
            }
            state.disconnected = true;
            state.peer = None;
            state.qp.clone()
        };
        if let Some(qp) = qp {
            qp.set_error();
        }
        self.raise(CmEventType::Disconnected, 0);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rdma::context::DeviceAttr;
    use crate::rdma::cq::Cq;
    use crate::rdma::qp::{QpCaps, QpState};

    fn next(channel: &EventChannel) -> CmEvent {
        channel.get_event_timeout(Duration::from_secs(1)).unwrap()
    }

    fn attach_qp(id: &CmId) -> Qp {
        let ctx = id.context().unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 4).unwrap();
        id.create_qp(
            &pd,
            QpBuilder::new()
                .send_cq(&cq)
                .recv_cq(&cq)
                .caps(QpCaps::with_depth(1)),
        )
        .unwrap()
    }

    fn listen(fabric: &Fabric, port: u16) -> (EventChannel, CmId) {
        let channel = EventChannel::new();
        let id = CmId::new(fabric, &channel, PortSpace::Tcp).unwrap();
        id.bind_addr(SocketAddr::from(([0, 0, 0, 0], port))).unwrap();
        id.listen(8).unwrap();
        (channel, id)
    }

    /// Drive an initiator up to the connection request.
    fn request(fabric: &Fabric, port: u16) -> (EventChannel, CmId) {
        let channel = EventChannel::new();
        let id = CmId::new(fabric, &channel, PortSpace::Tcp).unwrap();
        id.resolve_addr(None, SocketAddr::from(([127, 0, 0, 1], port)), 2000)
            .unwrap();
        let ev = next(&channel);
        assert_eq!(ev.event_type(), CmEventType::AddrResolved);
        ev.ack().unwrap();
        id.resolve_route(2000).unwrap();
        let ev = next(&channel);
        assert_eq!(ev.event_type(), CmEventType::RouteResolved);
        ev.ack().unwrap();
        attach_qp(&id);
        id.connect(&ConnParam::default()).unwrap();
        (channel, id)
    }

    #[test]
    fn handshake_and_disconnect() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let (lch, _listener) = listen(&fabric, 7471);
        let (cch, client) = request(&fabric, 7471);

        let ev = next(&lch);
        assert_eq!(ev.event_type(), CmEventType::ConnectRequest);
        assert_eq!(ev.param(), Some(&ConnParam::default()));
        let child = ev.id().clone();
        ev.ack().unwrap();
        attach_qp(&child);
        child.accept(&ConnParam::default()).unwrap();

        for ch in [&lch, &cch] {
            let ev = next(ch);
            assert_eq!(ev.event_type(), CmEventType::Established);
            ev.ack().unwrap();
        }
        assert_eq!(client.qp().unwrap().state(), QpState::Rts);

        client.disconnect().unwrap();
        client.disconnect().unwrap();
        for ch in [&lch, &cch] {
            let ev = next(ch);
            assert_eq!(ev.event_type(), CmEventType::Disconnected);
            ev.ack().unwrap();
        }
        child.disconnect().unwrap();
        assert_eq!(lch.pending() + cch.pending(), 0);
        assert_eq!(lch.unacked() + cch.unacked(), 0);
    }

    #[test]
    fn reject_reaches_initiator() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let (lch, _listener) = listen(&fabric, 7471);
        let (cch, _client) = request(&fabric, 7471);

        let ev = next(&lch);
        ev.id().reject().unwrap();
        ev.ack().unwrap();

        let ev = next(&cch);
        assert_eq!(ev.event_type(), CmEventType::Rejected);
        assert_eq!(ev.status(), REJECT_CONSUMER_DEFINED);
        ev.ack().unwrap();
    }

    #[test]
    fn no_listener_is_unreachable() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let (cch, _client) = request(&fabric, 7000);
        let ev = next(&cch);
        assert_eq!(ev.event_type(), CmEventType::Unreachable);
        assert_eq!(ev.status(), -libc::ECONNREFUSED);
        ev.ack().unwrap();
    }

    #[test]
    fn unspecified_destination_is_addr_error() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let id = CmId::new(&fabric, &channel, PortSpace::Tcp).unwrap();
        id.resolve_addr(None, SocketAddr::from(([0, 0, 0, 0], 7471)), 2000)
            .unwrap();
        let ev = next(&channel);
        assert_eq!(ev.event_type(), CmEventType::AddrError);
        assert_eq!(ev.status(), -libc::EADDRNOTAVAIL);
        ev.ack().unwrap();
    }

    #[test]
    fn double_listen_is_addr_in_use() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let (_ch, _listener) = listen(&fabric, 7471);
        let channel = EventChannel::new();
        let id = CmId::new(&fabric, &channel, PortSpace::Tcp).unwrap();
        id.bind_addr(SocketAddr::from(([0, 0, 0, 0], 7471))).unwrap();
        match id.listen(8) {
            Err(CmError::IoError(e)) => assert_eq!(e.raw_os_error(), Some(libc::EADDRINUSE)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn soft_identities_share_the_fabric_device() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let id = CmId::new(&fabric, &channel, PortSpace::Tcp).unwrap();
        assert_eq!(id.context().unwrap().name(), "soft0");
    }

    #[test]
    fn ack_timeout_range() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let id = CmId::new(&fabric, &channel, PortSpace::Tcp).unwrap();
        assert!(id.set_ack_timeout(32).is_err());
        id.set_ack_timeout(14).unwrap();
        id.set_tos(0x10).unwrap();
        assert_eq!((id.ack_timeout(), id.tos()), (Some(14), Some(0x10)));
    }

    #[test]
    fn device_removal_reaches_every_id() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let (lch, _listener) = listen(&fabric, 7471);
        fabric.remove_device();
        let ev = next(&lch);
        assert_eq!(ev.event_type(), CmEventType::DeviceRemoval);
        ev.ack().unwrap();
        assert!(CmId::new(&fabric, &lch, PortSpace::Tcp).is_err());
    }
}

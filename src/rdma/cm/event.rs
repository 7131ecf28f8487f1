use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use std::{fmt, io};

use super::{CmId, CmIdInner, ConnParam};
#[cfg(feature = "verbs")]
use super::{CmIdHandle, CmIdState};
use crate::rdma::fabric::Fabric;
#[cfg(feature = "verbs")]
use crate::rdma::verbs::{RawCmEvent, RawCmId, RawEventChannel};
use crate::utils::interop::from_errno;
use crate::utils::sync::lock;

/// Connection manager event types.
///
/// Discriminants follow `rdma_cm_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventType {
    AddrResolved = 0,
    AddrError = 1,
    RouteResolved = 2,
    RouteError = 3,
    ConnectRequest = 4,
    ConnectError = 6,
    Unreachable = 7,
    Rejected = 8,
    Established = 9,
    Disconnected = 10,
    DeviceRemoval = 11,
}

impl CmEventType {
    /// Whether the event reports a failure of the identity it concerns.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            CmEventType::AddrError
                | CmEventType::RouteError
                | CmEventType::ConnectError
                | CmEventType::Unreachable
                | CmEventType::Rejected
                | CmEventType::DeviceRemoval
        )
    }

    /// Convert a numeric `rdma_cm_event_type` value. Events this crate does
    /// not handle (connect responses, multicast, address changes and
    /// time-wait exits) are reported as `None`.
    pub fn from_raw(kind: u32) -> Option<Self> {
        use CmEventType::*;
        Some(match kind {
            0 => AddrResolved,
            1 => AddrError,
            2 => RouteResolved,
            3 => RouteError,
            4 => ConnectRequest,
            6 => ConnectError,
            7 => Unreachable,
            8 => Rejected,
            9 => Established,
            10 => Disconnected,
            11 => DeviceRemoval,
            _ => return None,
        })
    }
}

impl fmt::Display for CmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmEventType::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventType::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventType::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventType::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventType::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventType::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventType::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventType::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventType::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventType::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventType::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
        };
        f.write_str(s)
    }
}

/// Identity an event is about.
pub(super) enum Subject {
    /// A freshly created identity only the event keeps alive.
    Owned(CmId),
    Id(Weak<CmIdInner>),
}

pub(super) struct RawEvent {
    pub kind: CmEventType,
    pub status: i32,
    pub subject: Subject,
    pub listen_id: Option<Weak<CmIdInner>>,
    pub param: Option<ConnParam>,
}

/// librdmacm channel, with the fabric its identities are registered on.
#[cfg(feature = "verbs")]
struct HwChannel {
    raw: Arc<RawEventChannel>,
    fabric: Fabric,
}

pub(super) struct EventChannelInner {
    queue: Mutex<VecDeque<RawEvent>>,
    cond: Condvar,
    unacked: AtomicU32,
    #[cfg(feature = "verbs")]
    hw: Option<HwChannel>,
}

impl EventChannelInner {
    pub(super) fn push(&self, event: RawEvent) {
        lock(&self.queue).push_back(event);
        self.cond.notify_all();
    }
}

/// Connection manager event channel.
///
/// Identities report their events to the channel they were created on. Each
/// event returned by [`EventChannel::get_event`] must be acknowledged exactly
/// once with [`CmEvent::ack`]. Identities of a hardware fabric need a
/// channel made by [`EventChannel::open`].
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<EventChannelInner>,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("unacked", &self.unacked())
            .finish()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    /// Create a new event channel for a software fabric.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventChannelInner {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                unacked: AtomicU32::new(0),
                #[cfg(feature = "verbs")]
                hw: None,
            }),
        }
    }

    /// Create a new event channel for identities of `fabric`.
    pub fn open(fabric: &Fabric) -> io::Result<Self> {
        if fabric.is_soft() {
            return Ok(Self::new());
        }
        #[cfg(feature = "verbs")]
        {
            let hw = HwChannel {
                raw: Arc::new(RawEventChannel::create()?),
                fabric: fabric.clone(),
            };
            Ok(Self {
                inner: Arc::new(EventChannelInner {
                    queue: Mutex::new(VecDeque::new()),
                    cond: Condvar::new(),
                    unacked: AtomicU32::new(0),
                    hw: Some(hw),
                }),
            })
        }
        #[cfg(not(feature = "verbs"))]
        Err(from_errno(libc::ENOSYS))
    }

    /// Get the librdmacm channel, if this is a hardware channel.
    #[cfg(feature = "verbs")]
    pub(super) fn raw(&self) -> Option<&Arc<RawEventChannel>> {
        self.inner.hw.as_ref().map(|hw| &hw.raw)
    }

    pub(super) fn downgrade(&self) -> Weak<EventChannelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(super) fn from_inner(inner: Arc<EventChannelInner>) -> Self {
        Self { inner }
    }

    /// Number of events returned but not yet acknowledged.
    pub fn unacked(&self) -> u32 {
        self.inner.unacked.load(Ordering::Acquire)
    }

    /// Number of events waiting to be returned. Hardware channels do not
    /// expose it and always report zero.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Block until the next event arrives.
    pub fn get_event(&self) -> io::Result<CmEvent> {
        self.wait(None)
    }

    /// Block until the next event arrives or the timeout elapses, in which
    /// case fail with `ETIMEDOUT`.
    pub fn get_event_timeout(&self, timeout: Duration) -> io::Result<CmEvent> {
        self.wait(Some(Instant::now() + timeout))
    }

    fn wait(&self, deadline: Option<Instant>) -> io::Result<CmEvent> {
        #[cfg(feature = "verbs")]
        if let Some(hw) = &self.inner.hw {
            return self.wait_hw(hw, deadline);
        }

        let mut queue = lock(&self.inner.queue);
        loop {
            while let Some(raw) = queue.pop_front() {
                if let Some(event) = self.materialize(raw) {
                    self.inner.unacked.fetch_add(1, Ordering::AcqRel);
                    return Ok(event);
                }
            }

            let wait_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(from_errno(libc::ETIMEDOUT));
                    }
                    deadline - now
                }
                None => Duration::from_secs(1),
            };
            queue = match self.inner.cond.wait_timeout(queue, wait_for) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    #[cfg(feature = "verbs")]
    fn wait_hw(&self, hw: &HwChannel, deadline: Option<Instant>) -> io::Result<CmEvent> {
        loop {
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline || !hw.raw.wait(deadline - now)? {
                    return Err(from_errno(libc::ETIMEDOUT));
                }
            }
            let raw = hw.raw.get_event()?;
            if let Some(event) = self.materialize_hw(hw, raw)? {
                self.inner.unacked.fetch_add(1, Ordering::AcqRel);
                return Ok(event);
            }
        }
    }

    /// Turn a librdmacm event into a user-facing one. Unhandled event types
    /// and events of identities no longer alive are acknowledged and
    /// skipped.
    #[cfg(feature = "verbs")]
    fn materialize_hw(&self, hw: &HwChannel, raw: RawCmEvent) -> io::Result<Option<CmEvent>> {
        let Some(kind) = CmEventType::from_raw(raw.kind()) else {
            log::debug!("rwbench: skipping rdma_cm event {}", raw.kind());
            raw.ack()?;
            return Ok(None);
        };
        let listen_id = hw.fabric.lookup(CmIdHandle(raw.listen_id() as u64));

        let (id, param) = if kind == CmEventType::ConnectRequest {
            // SAFETY: the new identity of a connection request belongs to
            // whoever receives the event.
            let Some(child) = (unsafe { RawCmId::adopt(raw.id(), &hw.raw) }) else {
                raw.ack()?;
                return Ok(None);
            };
            let state = CmIdState {
                src: child.local_addr(),
                dst: child.peer_addr(),
                addr_resolved: true,
                route_resolved: true,
                request_pending: true,
                ..Default::default()
            };
            let ps = listen_id.as_ref().map(CmId::port_space).unwrap_or_default();
            let id = CmId::create_hw(&hw.fabric, self.downgrade(), ps, state, Arc::new(child));
            (id, Some(raw.conn_param()))
        } else {
            match hw.fabric.lookup(CmIdHandle(raw.id() as u64)) {
                Some(id) => (id, None),
                None => {
                    raw.ack()?;
                    return Ok(None);
                }
            }
        };
        id.note_event(kind);
        log::trace!("rwbench: {} <- {} ({})", id.handle(), kind, raw.status());

        Ok(Some(CmEvent {
            kind,
            status: raw.status(),
            id,
            listen_id,
            param,
            channel: self.clone(),
            acked: false,
            raw: Some(raw),
        }))
    }

    /// Turn a queued event into a user-facing one. Events of destroyed
    /// identities are dropped.
    fn materialize(&self, raw: RawEvent) -> Option<CmEvent> {
        let id = match raw.subject {
            Subject::Owned(id) => id,
            Subject::Id(weak) => CmId::from_inner(weak.upgrade()?),
        };
        Some(CmEvent {
            kind: raw.kind,
            status: raw.status,
            id,
            listen_id: raw
                .listen_id
                .and_then(|w| w.upgrade())
                .map(CmId::from_inner),
            param: raw.param,
            channel: self.clone(),
            acked: false,
            #[cfg(feature = "verbs")]
            raw: None,
        })
    }
}

/// Connection manager event.
///
/// Must be acknowledged with [`CmEvent::ack`]; dropping an unacknowledged
/// event leaks one unacknowledged count on its channel.
pub struct CmEvent {
    kind: CmEventType,
    status: i32,
    id: CmId,
    listen_id: Option<CmId>,
    param: Option<ConnParam>,
    channel: EventChannel,
    acked: bool,
    #[cfg(feature = "verbs")]
    raw: Option<RawCmEvent>,
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("id", &self.id.handle())
            .finish()
    }
}

impl CmEvent {
    /// Get the event type.
    #[inline]
    pub fn event_type(&self) -> CmEventType {
        self.kind
    }

    /// Get the event status: zero, or a negative errno / positive transport
    /// reason code on failures.
    #[inline]
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Get the identity the event concerns. For connection requests, this is
    /// the new identity of the incoming connection.
    #[inline]
    pub fn id(&self) -> &CmId {
        &self.id
    }

    /// Get the listening identity that received a connection request.
    #[inline]
    pub fn listen_id(&self) -> Option<&CmId> {
        self.listen_id.as_ref()
    }

    /// Get the connection parameters carried by a connection request.
    #[inline]
    pub fn param(&self) -> Option<&ConnParam> {
        self.param.as_ref()
    }

    /// Acknowledge the event.
    pub fn ack(mut self) -> io::Result<()> {
        self.acked = true;
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw.take() {
            raw.ack()?;
        }
        self.channel
            .inner
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| from_errno(libc::EINVAL))
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        if !self.acked {
            log::warn!("rwbench: {} event dropped without ack", self.kind);
        }
        // librdmacm blocks identity destruction on unacknowledged events.
        #[cfg(feature = "verbs")]
        drop(self.raw.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_without_events() {
        let channel = EventChannel::new();
        let err = channel
            .get_event_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
        assert_eq!(channel.unacked(), 0);
    }

    #[test]
    fn raw_event_types() {
        assert_eq!(CmEventType::from_raw(9), Some(CmEventType::Established));
        assert_eq!(CmEventType::from_raw(4), Some(CmEventType::ConnectRequest));
        // Connect response, multicast join, time-wait exit.
        for kind in [5, 12, 15] {
            assert_eq!(CmEventType::from_raw(kind), None);
        }
        for kind in [0, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11] {
            assert_eq!(CmEventType::from_raw(kind).map(|k| k as u32), Some(kind));
        }
    }

    #[test]
    fn soft_fabric_channels_need_no_device() {
        let fabric = Fabric::new("soft0", crate::rdma::context::DeviceAttr::default());
        let channel = EventChannel::open(&fabric).unwrap();
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn error_kinds() {
        assert!(CmEventType::Rejected.is_error());
        assert!(!CmEventType::Established.is_error());
        assert!(!CmEventType::Disconnected.is_error());
    }
}

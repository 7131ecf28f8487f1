//! Completion queue and Work completion.

mod wc;

#[cfg(feature = "verbs")]
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use std::{fmt, io};

use thiserror::Error;

pub use self::wc::*;
use super::context::{Context, ResourceKind};
#[cfg(feature = "verbs")]
use super::verbs::{RawCompChannel, RawCq};
use crate::utils::interop::from_errno;
use crate::utils::sync::lock;

/// Completion queue creation error type.
#[derive(Debug, Error)]
pub enum CqCreationError {
    /// The device refused the allocation.
    #[error("I/O error from device")]
    IoError(#[from] io::Error),

    /// Specified capacity is zero or beyond the device limit.
    #[error("invalid CQ capacity {0}, device supports 1..={1}")]
    InvalidCapacity(u32, u32),
}

/// A completion waiting in the queue.
struct CqEntry {
    wc: Wc,
    /// Send-queue slot to give back once the entry is reaped.
    slot: Option<Arc<AtomicU32>>,
}

impl CqEntry {
    fn take(self) -> Wc {
        if let Some(slot) = self.slot {
            slot.fetch_sub(1, Ordering::AcqRel);
        }
        self.wc
    }
}

#[derive(Default)]
struct CqState {
    entries: VecDeque<CqEntry>,
    armed: bool,
    overflowed: bool,
}

/// Ownership holder of completion queue.
struct CqInner {
    // Destroyed before the channel it reports to.
    #[cfg(feature = "verbs")]
    raw: Option<RawCq>,
    ctx: Context,
    capacity: u32,
    state: Mutex<CqState>,
    channel: Option<CompChannel>,
    unacked: AtomicU32,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        let unacked = self.unacked.load(Ordering::Acquire);
        if unacked > 0 {
            log::warn!("rwbench: CQ destroyed with {} unacknowledged events", unacked);
        }
        #[cfg(feature = "verbs")]
        if let Some(raw) = self.raw.take() {
            // `ibv_destroy_cq` waits for every event to be acknowledged.
            if unacked > 0 {
                raw.ack_events(unacked);
            }
            if let Some(channel) = &self.channel {
                channel.forget(&raw);
            }
        }
        self.ctx.release(ResourceKind::Cq);
    }
}

/// Completion queue.
///
/// This type is a simple wrapper of an `Arc`; clones refer to the same queue.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cq")
            .field("capacity", &self.inner.capacity)
            .field("with_channel", &self.inner.channel.is_some())
            .finish()
    }
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    fn create(
        ctx: &Context,
        capacity: u32,
        channel: Option<CompChannel>,
    ) -> Result<Cq, CqCreationError> {
        let max_capacity = ctx.attr().max_cqe;
        if capacity == 0 || capacity > max_capacity {
            return Err(CqCreationError::InvalidCapacity(capacity, max_capacity));
        }
        ctx.acquire(ResourceKind::Cq)?;

        #[cfg(feature = "verbs")]
        if let Some(raw_ctx) = ctx.raw() {
            let raw_channel = channel.as_ref().and_then(|c| c.inner.raw.as_ref());
            let raw = match RawCq::create(raw_ctx, capacity, raw_channel) {
                Ok(raw) => raw,
                Err(e) => {
                    ctx.release(ResourceKind::Cq);
                    return Err(e.into());
                }
            };
            let cq = Self {
                inner: Arc::new(CqInner {
                    raw: Some(raw),
                    ctx: ctx.clone(),
                    capacity,
                    state: Mutex::new(CqState::default()),
                    channel,
                    unacked: AtomicU32::new(0),
                }),
            };
            if let Some(channel) = &cq.inner.channel {
                channel.track(&cq);
            }
            return Ok(cq);
        }

        Ok(Self {
            inner: Arc::new(CqInner {
                #[cfg(feature = "verbs")]
                raw: None,
                ctx: ctx.clone(),
                capacity,
                state: Mutex::new(CqState::default()),
                channel,
                unacked: AtomicU32::new(0),
            }),
        })
    }

    /// Create a new completion queue.
    pub fn new(ctx: &Context, capacity: u32) -> Result<Cq, CqCreationError> {
        Self::create(ctx, capacity, None)
    }

    /// Create a new completion queue that reports to the given completion
    /// event channel once armed with [`Cq::req_notify`].
    pub fn with_channel(
        ctx: &Context,
        capacity: u32,
        channel: &CompChannel,
    ) -> Result<Cq, CqCreationError> {
        Self::create(ctx, capacity, Some(channel.clone()))
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    #[cfg(feature = "verbs")]
    #[inline]
    pub(crate) fn raw(&self) -> Option<&RawCq> {
        self.inner.raw.as_ref()
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Get the completion channel this queue reports to, if any.
    #[inline]
    pub fn channel(&self) -> Option<&CompChannel> {
        self.inner.channel.as_ref()
    }

    fn check_polling(&self, state: &CqState) -> io::Result<()> {
        self.inner.ctx.check_alive()?;
        if state.overflowed {
            return Err(from_errno(libc::EOVERFLOW));
        }
        Ok(())
    }

    /// Non-blockingly poll. Return the work completions polled.
    ///
    /// It is the caller's responsibility to check the status codes of the
    /// returned work completion entries.
    pub fn poll(&self) -> io::Result<Vec<Wc>> {
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            let mut wcs = Vec::new();
            let mut buf = [Wc::default(); 16];
            loop {
                let n = raw.poll_into(&mut buf)?;
                wcs.extend_from_slice(&buf[..n]);
                if n < buf.len() {
                    return Ok(wcs);
                }
            }
        }

        let mut state = lock(&self.inner.state);
        self.check_polling(&state)?;
        Ok(state.entries.drain(..).map(CqEntry::take).collect())
    }

    /// Non-blockingly poll one work completion. Return the work completion
    /// polled.
    ///
    /// It is the caller's responsibility to check the status code of the
    /// returned work completion entry.
    #[inline]
    pub fn poll_one(&self) -> io::Result<Option<Wc>> {
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            let mut wc = [Wc::default()];
            let n = raw.poll_into(&mut wc)?;
            return Ok((n == 1).then_some(wc[0]));
        }

        let mut state = lock(&self.inner.state);
        self.check_polling(&state)?;
        Ok(state.entries.pop_front().map(CqEntry::take))
    }

    /// Non-blockingly poll into the given buffer. Return the number of work
    /// completions polled.
    ///
    /// It is the caller's responsibility to check the status codes of the
    /// returned work completion entries.
    ///
    /// **NOTE:** It is possible that the number of polled work completions is
    /// less than `wc.len()` or even zero. Entries beyond the number of polled
    /// work completions are left untouched.
    pub fn poll_into(&self, wc: &mut [Wc]) -> io::Result<u32> {
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            return raw.poll_into(wc).map(|n| n as u32);
        }

        let mut state = lock(&self.inner.state);
        self.check_polling(&state)?;
        let n = wc.len().min(state.entries.len());
        for (slot, entry) in wc.iter_mut().zip(state.entries.drain(..n)) {
            *slot = entry.take();
        }
        Ok(n as u32)
    }

    /// Blockingly poll until `num` work completions are polled. Spins.
    ///
    /// It is the caller's responsibility to check the status codes of the
    /// returned work completion entries.
    pub fn poll_blocking(&self, num: u32) -> io::Result<Vec<Wc>> {
        let mut wcs = vec![Wc::default(); num as usize];
        let mut polled = 0;
        while polled < num as usize {
            polled += self.poll_into(&mut wcs[polled..])? as usize;
            if polled < num as usize {
                std::hint::spin_loop();
            }
        }
        Ok(wcs)
    }

    /// Arm the queue so that the next completion added to it raises an event
    /// on its completion channel.
    ///
    /// Fails with `EINVAL` if the queue has no completion channel.
    pub fn req_notify(&self) -> io::Result<()> {
        self.inner.ctx.check_alive()?;
        if self.inner.channel.is_none() {
            return Err(from_errno(libc::EINVAL));
        }
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            return raw.req_notify();
        }
        lock(&self.inner.state).armed = true;
        Ok(())
    }

    /// Acknowledge completion events returned by
    /// [`CompChannel::get_cq_event`] for this queue.
    pub fn ack_events(&self, num: u32) {
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            raw.ack_events(num.min(self.unacked_events()));
        }
        let _ = self
            .inner
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(num))
            });
    }

    /// Get the number of delivered but unacknowledged completion events.
    #[inline]
    pub fn unacked_events(&self) -> u32 {
        self.inner.unacked.load(Ordering::Acquire)
    }

    /// Add a completion, releasing `slot` when it is reaped.
    pub(crate) fn push(&self, wc: Wc, slot: Option<Arc<AtomicU32>>) {
        let notify = {
            let mut state = lock(&self.inner.state);
            if state.entries.len() >= self.inner.capacity as usize {
                log::error!("rwbench: CQ overrun, dropping completion of WR {}", wc.wr_id);
                state.overflowed = true;
                if let Some(slot) = slot {
                    slot.fetch_sub(1, Ordering::AcqRel);
                }
                return;
            }
            state.entries.push_back(CqEntry { wc, slot });
            std::mem::take(&mut state.armed)
        };
        if notify {
            if let Some(channel) = &self.inner.channel {
                channel.notify(Arc::downgrade(&self.inner));
            }
        }
    }
}

impl PartialEq for Cq {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Cq {}

struct CompChannelInner {
    ctx: Context,
    events: Mutex<VecDeque<Weak<CqInner>>>,
    cond: Condvar,
    /// Hardware channel and the queues bound to it, by `ibv_cq` address.
    #[cfg(feature = "verbs")]
    raw: Option<RawCompChannel>,
    #[cfg(feature = "verbs")]
    cqs: Mutex<HashMap<usize, Weak<CqInner>>>,
}

/// Completion event channel.
///
/// Armed completion queues bound to the channel raise one event each time a
/// completion arrives after arming.
#[derive(Clone)]
pub struct CompChannel {
    inner: Arc<CompChannelInner>,
}

impl fmt::Debug for CompChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompChannel").finish_non_exhaustive()
    }
}

impl CompChannel {
    const WAIT_SLICE: Duration = Duration::from_millis(100);

    /// Create a new completion event channel.
    pub fn new(ctx: &Context) -> io::Result<Self> {
        ctx.check_alive()?;
        #[cfg(feature = "verbs")]
        let raw = ctx.raw().map(RawCompChannel::create).transpose()?;
        Ok(Self {
            inner: Arc::new(CompChannelInner {
                ctx: ctx.clone(),
                events: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                #[cfg(feature = "verbs")]
                raw,
                #[cfg(feature = "verbs")]
                cqs: Mutex::new(HashMap::new()),
            }),
        })
    }

    #[cfg(feature = "verbs")]
    fn track(&self, cq: &Cq) {
        if let Some(raw) = &cq.inner.raw {
            lock(&self.inner.cqs).insert(raw.as_ptr() as usize, Arc::downgrade(&cq.inner));
        }
    }

    #[cfg(feature = "verbs")]
    fn forget(&self, cq: &RawCq) {
        lock(&self.inner.cqs).remove(&(cq.as_ptr() as usize));
    }

    fn notify(&self, cq: Weak<CqInner>) {
        lock(&self.inner.events).push_back(cq);
        self.inner.cond.notify_all();
    }

    /// Block until a completion event arrives and return the queue that
    /// raised it. The event must later be acknowledged with
    /// [`Cq::ack_events`]; the queue must be re-armed to raise another.
    ///
    /// Fails with `ENODEV` once the device has been removed.
    pub fn get_cq_event(&self) -> io::Result<Cq> {
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            let fired = raw.get_cq_event()? as usize;
            let inner = lock(&self.inner.cqs)
                .get(&fired)
                .and_then(Weak::upgrade)
                .ok_or_else(|| from_errno(libc::ENOENT))?;
            inner.unacked.fetch_add(1, Ordering::AcqRel);
            return Ok(Cq { inner });
        }

        let mut events = lock(&self.inner.events);
        loop {
            self.inner.ctx.check_alive()?;
            while let Some(cq) = events.pop_front() {
                // Events of destroyed queues are dropped.
                if let Some(inner) = cq.upgrade() {
                    inner.unacked.fetch_add(1, Ordering::AcqRel);
                    return Ok(Cq { inner });
                }
            }
            events = match self.inner.cond.wait_timeout(events, Self::WAIT_SLICE) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::DeviceAttr;

    fn wc(wr_id: u64) -> Wc {
        Wc {
            wr_id,
            ..Default::default()
        }
    }

    #[test]
    fn capacity_limits() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        assert!(matches!(
            Cq::new(&ctx, 0),
            Err(CqCreationError::InvalidCapacity(0, _))
        ));
        assert!(Cq::new(&ctx, ctx.attr().max_cqe + 1).is_err());
        assert!(Cq::new(&ctx, 1).is_ok());
        assert_eq!(ctx.usage().cqs, 0);
    }

    #[test]
    fn poll_in_order_and_release_slots() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let cq = Cq::new(&ctx, 4).unwrap();
        let slot = Arc::new(AtomicU32::new(2));
        cq.push(wc(1), Some(slot.clone()));
        cq.push(wc(2), Some(slot.clone()));

        let mut buf = [Wc::default(); 1];
        assert_eq!(cq.poll_into(&mut buf).unwrap(), 1);
        assert_eq!(buf[0].wr_id(), 1);
        assert_eq!(slot.load(Ordering::Acquire), 1);
        assert_eq!(cq.poll_one().unwrap().map(|w| w.wr_id()), Some(2));
        assert_eq!(slot.load(Ordering::Acquire), 0);
        assert!(cq.poll_one().unwrap().is_none());
    }

    #[test]
    fn overrun_is_reported() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let cq = Cq::new(&ctx, 1).unwrap();
        cq.push(wc(1), None);
        cq.push(wc(2), None);
        assert_eq!(
            cq.poll().unwrap_err().raw_os_error(),
            Some(libc::EOVERFLOW)
        );
    }

    #[test]
    fn armed_queue_raises_one_event() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let channel = CompChannel::new(&ctx).unwrap();
        let cq = Cq::with_channel(&ctx, 4, &channel).unwrap();

        cq.req_notify().unwrap();
        cq.push(wc(1), None);
        cq.push(wc(2), None);

        let fired = channel.get_cq_event().unwrap();
        assert_eq!(fired, cq);
        assert_eq!(cq.unacked_events(), 1);
        cq.ack_events(1);
        assert_eq!(cq.unacked_events(), 0);
        assert_eq!(cq.poll().unwrap().len(), 2);

        // Not re-armed: no new event is queued.
        cq.push(wc(3), None);
        assert!(lock(&channel.inner.events).is_empty());
    }

    #[test]
    fn notify_requires_channel() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let cq = Cq::new(&ctx, 4).unwrap();
        assert_eq!(
            cq.req_notify().unwrap_err().raw_os_error(),
            Some(libc::EINVAL)
        );
    }

    #[test]
    fn removed_device_fails_waits() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let channel = CompChannel::new(&ctx).unwrap();
        ctx.mark_removed();
        assert_eq!(
            channel.get_cq_event().unwrap_err().raw_os_error(),
            Some(libc::ENODEV)
        );
    }
}

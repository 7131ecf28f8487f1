//! Reliable-connected queue pair.

mod builder;
mod state;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::{fmt, io, ptr};

use thiserror::Error;

pub use self::builder::*;
pub use self::state::*;
use crate::rdma::context::{Context, MrEntry, MrTable, ResourceKind};
use crate::rdma::cq::{Cq, Wc, WcOpcode, WcStatus};
use crate::rdma::mr::{MrRemote, MrSlice, Permission, Sge};
use crate::rdma::pd::Pd;
use crate::rdma::type_alias::*;
#[cfg(feature = "verbs")]
use crate::rdma::verbs::{RawCmId, RawQp};
use crate::rdma::wr::{RecvWr, SendOp, SendWr};
use crate::utils::sync::lock;

/// Queue pair creation error type.
#[derive(Debug, Error)]
pub enum QpCreationError {
    /// The device refused the allocation.
    #[error("I/O error from device")]
    IoError(#[from] io::Error),

    /// Specified capabilities are not supported by the device.
    /// The three fields are for the capability name, the maximum supported
    /// value, and the required value.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(String, u32, u32),

    /// A completion queue was not specified.
    #[error("missing {0} completion queue")]
    MissingCq(&'static str),

    /// A completion queue lives on another device.
    #[error("completion queue belongs to another device")]
    ForeignCq,

    /// Hardware queue pairs can only be created on a connection manager
    /// identity.
    #[error("hardware queue pairs need a connection manager identity")]
    NeedsCmId,
}

/// Work request posting error type.
///
/// These errors are reported synchronously and generate no completion.
#[derive(Debug, Error)]
pub enum PostError {
    /// The device reported an error.
    #[error("I/O error from device")]
    IoError(#[from] io::Error),

    /// The queue already holds its maximum number of outstanding requests.
    #[error("work queue full ({0} outstanding)")]
    QueueFull(u32),

    /// Too many scatter/gather entries.
    /// The two fields are the requested and the supported count.
    #[error("too many SGEs: {0} requested, up to {1} supported")]
    TooManySge(usize, u32),

    /// The queue pair is in a state that does not accept the request.
    #[error("cannot post in QP state {0}")]
    InvalidState(QpState),
}

struct QpShared {
    state: QpState,
    recvs: VecDeque<RecvWr>,
    peer: Option<Weak<QpInner>>,
}

/// Ownership holder of queue pair.
struct QpInner {
    // Destroyed before the CQs and the PD it uses.
    #[cfg(feature = "verbs")]
    raw: Option<RawQp>,
    pd: Pd,
    qpn: Qpn,
    send_cq: Cq,
    recv_cq: Cq,
    caps: QpCaps,
    sq_sig_all: bool,
    shared: Mutex<QpShared>,
    /// Signaled send requests not yet reaped from the send CQ.
    send_slots: Arc<AtomicU32>,
}

impl Drop for QpInner {
    fn drop(&mut self) {
        log::trace!("rwbench: destroy QP {:#x}", self.qpn);
        self.pd.context().release(ResourceKind::Qp);
    }
}

/// Reliable-connected queue pair.
///
/// This type is a simple wrapper of an `Arc`; clones refer to the same queue
/// pair. Work requests execute when posted: their completions are already in
/// the completion queues when `post_send`/`post_recv` return.
#[derive(Clone)]
pub struct Qp {
    inner: Arc<QpInner>,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qp")
            .field("qpn", &self.inner.qpn)
            .field("state", &self.state())
            .finish()
    }
}

impl Qp {
    /// Check whether the given capabilities are supported by the device.
    fn check_caps(ctx: &Context, caps: &QpCaps) -> Result<(), QpCreationError> {
        let attr = ctx.attr();
        let checks = [
            ("max_send_wr", attr.max_qp_wr, caps.max_send_wr),
            ("max_recv_wr", attr.max_qp_wr, caps.max_recv_wr),
            ("max_send_sge", attr.max_sge, caps.max_send_sge),
            ("max_recv_sge", attr.max_sge, caps.max_recv_sge),
        ];
        for (name, max, required) in checks {
            if required > max {
                return Err(QpCreationError::CapabilityNotEnough(
                    name.to_owned(),
                    max,
                    required,
                ));
            }
        }
        Ok(())
    }

    /// Validate the builder against the device. Return both CQs.
    fn prepare(pd: &Pd, builder: &QpBuilder) -> Result<(Cq, Cq), QpCreationError> {
        let ctx = pd.context();
        Self::check_caps(ctx, &builder.caps)?;
        let send_cq = builder
            .send_cq
            .clone()
            .ok_or(QpCreationError::MissingCq("send"))?;
        let recv_cq = builder
            .recv_cq
            .clone()
            .ok_or(QpCreationError::MissingCq("recv"))?;
        if !send_cq.context().same_device(ctx) || !recv_cq.context().same_device(ctx) {
            return Err(QpCreationError::ForeignCq);
        }
        Ok((send_cq, recv_cq))
    }

    fn wrap(pd: &Pd, qpn: Qpn, cqs: (Cq, Cq), builder: &QpBuilder) -> QpInner {
        QpInner {
            #[cfg(feature = "verbs")]
            raw: None,
            pd: pd.clone(),
            qpn,
            send_cq: cqs.0,
            recv_cq: cqs.1,
            caps: builder.caps,
            sq_sig_all: builder.sq_sig_all,
            shared: Mutex::new(QpShared {
                state: QpState::Reset,
                recvs: VecDeque::new(),
                peer: None,
            }),
            send_slots: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Create a new queue pair in the `Reset` state.
    pub(crate) fn new(pd: &Pd, builder: QpBuilder) -> Result<Self, QpCreationError> {
        let ctx = pd.context();
        if !ctx.is_soft() {
            return Err(QpCreationError::NeedsCmId);
        }
        let cqs = Self::prepare(pd, &builder)?;
        ctx.acquire(ResourceKind::Qp)?;

        let qpn = ctx.alloc_qpn();
        log::trace!("rwbench: create QP {:#x} caps={:?}", qpn, builder.caps);
        Ok(Self {
            inner: Arc::new(Self::wrap(pd, qpn, cqs, &builder)),
        })
    }

    /// Create a hardware queue pair on a connection manager identity. It
    /// starts in the `Init` state.
    #[cfg(feature = "verbs")]
    pub(crate) fn new_on_id(
        pd: &Pd,
        builder: QpBuilder,
        id: &Arc<RawCmId>,
    ) -> Result<Self, QpCreationError> {
        let (send_cq, recv_cq) = Self::prepare(pd, &builder)?;
        let (Some(raw_pd), Some(raw_scq), Some(raw_rcq)) =
            (pd.raw(), send_cq.raw(), recv_cq.raw())
        else {
            return Err(QpCreationError::ForeignCq);
        };
        let ctx = pd.context();
        ctx.acquire(ResourceKind::Qp)?;
        let raw = match RawQp::create(id, raw_pd, raw_scq, raw_rcq, &builder.caps, builder.sq_sig_all) {
            Ok(raw) => raw,
            Err(e) => {
                ctx.release(ResourceKind::Qp);
                return Err(e.into());
            }
        };

        let qpn = raw.qp_num();
        log::debug!("rwbench: rdma_create_qp QP {:#x} caps={:?}", qpn, builder.caps);
        let mut inner = Self::wrap(pd, qpn, (send_cq, recv_cq), &builder);
        inner.raw = Some(raw);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Get the QP number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.inner.qpn
    }

    /// Get the protection domain of the queue pair.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.inner.pd
    }

    /// Get the send completion queue.
    #[inline]
    pub fn scq(&self) -> &Cq {
        &self.inner.send_cq
    }

    /// Get the receive completion queue.
    #[inline]
    pub fn rcq(&self) -> &Cq {
        &self.inner.recv_cq
    }

    /// Get the capabilities of the queue pair.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.inner.caps
    }

    /// Get the current state of the queue pair.
    pub fn state(&self) -> QpState {
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            return raw.state().unwrap_or_else(|e| {
                log::warn!("rwbench: ibv_query_qp QP {:#x} failed: {}", self.inner.qpn, e);
                QpState::Error
            });
        }
        lock(&self.inner.shared).state
    }

    /// Number of posted receives not yet consumed. Hardware queue pairs do
    /// not expose it and always report zero.
    pub fn posted_recvs(&self) -> usize {
        lock(&self.inner.shared).recvs.len()
    }

    /// Move a `Reset` queue pair to `Init`. librdmacm does it for hardware
    /// queue pairs.
    pub(crate) fn init(&self) {
        let mut shared = lock(&self.inner.shared);
        if shared.state == QpState::Reset {
            shared.state = QpState::Init;
        }
    }

    /// Connect two queue pairs with each other and move both to `Rts`.
    pub(crate) fn bind_peers(a: &Qp, b: &Qp) {
        for (this, peer) in [(a, b), (b, a)] {
            let mut shared = lock(&this.inner.shared);
            shared.peer = Some(Arc::downgrade(&peer.inner));
            if shared.state != QpState::Error {
                shared.state = QpState::Rts;
            }
        }
        log::debug!(
            "rwbench: QP {:#x} <-> QP {:#x} ready to send",
            a.qp_num(),
            b.qp_num()
        );
    }

    /// Move the queue pair to `Error`, flushing every posted receive.
    pub(crate) fn set_error(&self) {
        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            if let Err(e) = raw.set_error() {
                log::warn!("rwbench: cannot move QP {:#x} to ERR: {}", self.inner.qpn, e);
            }
            return;
        }

        let flushed = {
            let mut shared = lock(&self.inner.shared);
            shared.state = QpState::Error;
            shared.peer = None;
            shared.recvs.drain(..).collect::<Vec<_>>()
        };
        for wr in flushed {
            self.inner
                .recv_cq
                .push(self.completion(wr.wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0), None);
        }
    }

    /// Get the connected peer, if it is still alive.
    pub(crate) fn peer(&self) -> Option<Qp> {
        lock(&self.inner.shared)
            .peer
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Qp { inner })
    }

    fn completion(&self, wr_id: WrId, status: WcStatus, opcode: WcOpcode, len: usize) -> Wc {
        Wc {
            wr_id,
            status,
            opcode,
            byte_len: len as u32,
            qp_num: self.inner.qpn,
        }
    }

    /// Post a receive request.
    pub fn post_recv(&self, wr: &RecvWr) -> Result<(), PostError> {
        self.inner.pd.context().check_alive()?;
        if wr.sgl.len() > self.inner.caps.max_recv_sge as usize {
            return Err(PostError::TooManySge(
                wr.sgl.len(),
                self.inner.caps.max_recv_sge,
            ));
        }

        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            return raw.post_recv(wr).map_err(|e| self.post_error(e, self.inner.caps.max_recv_wr));
        }

        let mut shared = lock(&self.inner.shared);
        match shared.state {
            QpState::Reset => return Err(PostError::InvalidState(QpState::Reset)),
            QpState::Error => {
                drop(shared);
                let wc = self.completion(wr.wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, 0);
                self.inner.recv_cq.push(wc, None);
                return Ok(());
            }
            _ => {}
        }
        let outstanding = shared.recvs.len() as u32;
        if outstanding >= self.inner.caps.max_recv_wr {
            return Err(PostError::QueueFull(outstanding));
        }
        shared.recvs.push_back(wr.clone());
        Ok(())
    }

    /// Post a send request. It executes before this call returns.
    pub fn post_send(&self, wr: &SendWr) -> Result<(), PostError> {
        self.inner.pd.context().check_alive()?;
        if wr.sgl.len() > self.inner.caps.max_send_sge as usize {
            return Err(PostError::TooManySge(
                wr.sgl.len(),
                self.inner.caps.max_send_sge,
            ));
        }

        #[cfg(feature = "verbs")]
        if let Some(raw) = &self.inner.raw {
            return raw.post_send(wr).map_err(|e| self.post_error(e, self.inner.caps.max_send_wr));
        }

        let state = self.state();
        if !state.can_post_send() {
            return Err(PostError::InvalidState(state));
        }
        let signaled = wr.signaled || self.inner.sq_sig_all || state == QpState::Error;
        let slots = &self.inner.send_slots;
        if signaled {
            let outstanding = slots.load(Ordering::Acquire);
            if outstanding >= self.inner.caps.max_send_wr {
                return Err(PostError::QueueFull(outstanding));
            }
        }

        let opcode = match wr.op {
            SendOp::Send => WcOpcode::Send,
            SendOp::Write(_) => WcOpcode::RdmaWrite,
            SendOp::Read(_) => WcOpcode::RdmaRead,
        };
        let (status, len) = if state == QpState::Error {
            (WcStatus::WrFlushErr, 0)
        } else {
            match self.execute(wr) {
                Ok(len) => (WcStatus::Success, len),
                Err(status) => (status, 0),
            }
        };

        if status != WcStatus::Success && status != WcStatus::WrFlushErr {
            log::debug!(
                "rwbench: QP {:#x} WR {} failed: {}",
                self.inner.qpn,
                wr.wr_id,
                status
            );
            self.set_error();
        }
        if signaled || status != WcStatus::Success {
            slots.fetch_add(1, Ordering::AcqRel);
            let wc = self.completion(wr.wr_id, status, opcode, len);
            self.inner.send_cq.push(wc, Some(slots.clone()));
        }
        Ok(())
    }

    /// Translate a provider error: `ENOMEM` means the work queue is full.
    #[cfg(feature = "verbs")]
    fn post_error(&self, err: io::Error, depth: u32) -> PostError {
        match err.raw_os_error() {
            Some(libc::ENOMEM) => PostError::QueueFull(depth),
            Some(libc::EINVAL) => PostError::InvalidState(self.state()),
            _ => PostError::IoError(err),
        }
    }

    /// Check that every local SGE lies in a region of this QP's protection
    /// domain granting `perm`.
    fn check_local(&self, table: &MrTable, sgl: &[Sge], perm: Permission) -> Result<(), WcStatus> {
        let pdn = self.inner.pd.pdn();
        for sge in sgl {
            let ok = table.local(sge.lkey).is_some_and(|e: &MrEntry| {
                e.pd == pdn && e.perm.contains(perm) && e.contains(sge.addr, sge.length as usize)
            });
            if !ok {
                return Err(WcStatus::LocProtErr);
            }
        }
        Ok(())
    }

    /// Check that `remote` lies in a region of `responder`'s protection domain
    /// granting `perm`.
    fn check_remote(
        table: &MrTable,
        responder: &Qp,
        remote: &MrRemote,
        len: usize,
        perm: Permission,
    ) -> Result<(), WcStatus> {
        let ok = table.remote(remote.rkey).is_some_and(|e| {
            e.pd == responder.inner.pd.pdn() && e.perm.contains(perm) && e.contains(remote.addr, len)
        });
        if ok {
            Ok(())
        } else {
            Err(WcStatus::RemAccessErr)
        }
    }

    /// Execute a send request against its peer. Return the byte count moved.
    fn execute(&self, wr: &SendWr) -> Result<usize, WcStatus> {
        let peer = self.peer().ok_or(WcStatus::RetryExcErr)?;
        let len = wr.total_len();
        let ctx = self.inner.pd.context();
        // Held across the copy so no region can be deregistered mid-flight.
        let table = ctx.mr_table();

        match wr.op {
            SendOp::Write(remote) => {
                self.check_local(&table, &wr.sgl, Permission::EMPTY)?;
                Self::check_remote(&table, &peer, &remote, len, Permission::REMOTE_WRITE)?;
                let mut dst = remote.addr;
                for sge in &wr.sgl {
                    // SAFETY: both ranges were validated against live registrations.
                    unsafe {
                        ptr::copy(sge.addr as *const u8, dst as *mut u8, sge.length as usize)
                    };
                    dst += sge.length as u64;
                }
                Ok(len)
            }
            SendOp::Read(remote) => {
                self.check_local(&table, &wr.sgl, Permission::LOCAL_WRITE)?;
                Self::check_remote(&table, &peer, &remote, len, Permission::REMOTE_READ)?;
                let mut src = remote.addr;
                for sge in &wr.sgl {
                    // SAFETY: both ranges were validated against live registrations.
                    unsafe {
                        ptr::copy(src as *const u8, sge.addr as *mut u8, sge.length as usize)
                    };
                    src += sge.length as u64;
                }
                Ok(len)
            }
            SendOp::Send => {
                self.check_local(&table, &wr.sgl, Permission::EMPTY)?;
                let recv = {
                    let mut shared = lock(&peer.inner.shared);
                    if shared.state == QpState::Error {
                        return Err(WcStatus::RetryExcErr);
                    }
                    shared.recvs.pop_front()
                };
                let recv = recv.ok_or(WcStatus::RnrRetryExcErr)?;
                let recv_status = if recv.total_len() < len {
                    Err(WcStatus::LocLenErr)
                } else {
                    peer.check_local(&table, &recv.sgl, Permission::LOCAL_WRITE)
                };
                if let Err(status) = recv_status {
                    drop(table);
                    peer.inner
                        .recv_cq
                        .push(peer.completion(recv.wr_id, status, WcOpcode::Recv, 0), None);
                    peer.set_error();
                    return Err(WcStatus::RemInvReqErr);
                }

                scatter(&wr.sgl, &recv.sgl);
                drop(table);
                peer.inner
                    .recv_cq
                    .push(peer.completion(recv.wr_id, WcStatus::Success, WcOpcode::Recv, len), None);
                Ok(len)
            }
        }
    }

    /// Post a signaled send of `local` with the given work request ID.
    pub fn send(&self, local: &[MrSlice], wr_id: WrId) -> Result<(), PostError> {
        let mut wr = SendWr::new(wr_id);
        wr.set_wr_send();
        local.iter().for_each(|s| {
            wr.push_sge(*s);
        });
        self.post_send(&wr)
    }

    /// Post a receive into `local` with the given work request ID.
    pub fn recv(&self, local: &[MrSlice], wr_id: WrId) -> Result<(), PostError> {
        let mut wr = RecvWr::new(wr_id);
        local.iter().for_each(|s| {
            wr.push_sge(*s);
        });
        self.post_recv(&wr)
    }

    /// Post a signaled RDMA write of `local` to `remote`.
    pub fn write(&self, local: &[MrSlice], remote: &MrRemote, wr_id: WrId) -> Result<(), PostError> {
        let mut wr = SendWr::new(wr_id);
        wr.set_wr_write(*remote);
        local.iter().for_each(|s| {
            wr.push_sge(*s);
        });
        self.post_send(&wr)
    }

    /// Post a signaled RDMA read of `remote` into `local`.
    pub fn read(&self, local: &[MrSlice], remote: &MrRemote, wr_id: WrId) -> Result<(), PostError> {
        let mut wr = SendWr::new(wr_id);
        wr.set_wr_read(*remote);
        local.iter().for_each(|s| {
            wr.push_sge(*s);
        });
        self.post_send(&wr)
    }
}

impl PartialEq for Qp {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Qp {}

/// Copy the gather list into the scatter list, entry boundaries independent.
fn scatter(gather: &[Sge], scatter: &[Sge]) {
    let mut dst = scatter.iter().map(|s| (s.addr, s.length as u64));
    let mut cur = dst.next();
    for src in gather {
        let (mut src_addr, mut remaining) = (src.addr, src.length as u64);
        while remaining > 0 {
            let Some((addr, room)) = cur.as_mut() else {
                return;
            };
            let n = remaining.min(*room);
            // SAFETY: both lists were validated against live registrations.
            unsafe { ptr::copy(src_addr as *const u8, *addr as *mut u8, n as usize) };
            src_addr += n;
            remaining -= n;
            *addr += n;
            *room -= n;
            if *room == 0 {
                cur = dst.next();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::DeviceAttr;
    use crate::rdma::mr::Mr;

    struct Side {
        pd: Pd,
        qp: Qp,
        mr: Mr,
        _buf: Box<[u8]>,
    }

    fn side(ctx: &Context, pd: Option<&Pd>, depth: u32, fill: u8) -> Side {
        let pd = pd.cloned().unwrap_or_else(|| Pd::new(ctx).unwrap());
        let cq = Cq::new(ctx, 16).unwrap();
        let qp = QpBuilder::new()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::with_depth(depth))
            .build(&pd)
            .unwrap();
        qp.init();
        let mut buf = vec![fill; 64].into_boxed_slice();
        let mr = unsafe { Mr::reg_raw(&pd, buf.as_mut_ptr(), buf.len(), Permission::default()) }
            .unwrap();
        Side { pd, qp, mr, _buf: buf }
    }

    fn bytes(mr: &Mr) -> &[u8] {
        unsafe { std::slice::from_raw_parts(mr.addr(), mr.len()) }
    }

    fn connected(depth: u32) -> (Context, Side, Side) {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let a = side(&ctx, None, depth, 0xaa);
        let b = side(&ctx, None, depth, 0xbb);
        Qp::bind_peers(&a.qp, &b.qp);
        (ctx, a, b)
    }

    #[test]
    fn write_then_read() {
        let (_ctx, a, b) = connected(4);
        let remote = b.mr.as_remote().unwrap();

        a.qp.write(&[a.mr.slice(0, 32).unwrap()], &remote, 1).unwrap();
        let wc = a.qp.scq().poll_one().unwrap().unwrap();
        assert_eq!((wc.wr_id(), wc.ok()), (1, Ok(32)));
        assert_eq!(&bytes(&b.mr)[..32], &[0xaa; 32]);
        assert_eq!(&bytes(&b.mr)[32..], &[0xbb; 32]);

        a.qp.read(&[a.mr.slice(32, 32).unwrap()], &remote.slice(32, 32).unwrap(), 2)
            .unwrap();
        let wc = a.qp.scq().poll_one().unwrap().unwrap();
        assert_eq!(wc.opcode(), WcOpcode::RdmaRead);
        assert_eq!(&bytes(&a.mr)[32..], &[0xbb; 32]);
    }

    #[test]
    fn send_without_recv_is_rnr() {
        let (_ctx, a, _b) = connected(4);
        a.qp.send(&[a.mr.slice(0, 16).unwrap()], 7).unwrap();
        let wc = a.qp.scq().poll_one().unwrap().unwrap();
        assert_eq!(wc.status(), WcStatus::RnrRetryExcErr);
        assert_eq!(a.qp.state(), QpState::Error);
    }

    #[test]
    fn send_consumes_recv() {
        let (_ctx, a, b) = connected(4);
        b.qp.recv(&[b.mr.slice(0, 16).unwrap()], 9).unwrap();
        a.qp.send(&[a.mr.slice(0, 16).unwrap()], 8).unwrap();

        let wcs = a.qp.scq().poll().unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status(), WcStatus::Success);
        let wc = b.qp.rcq().poll_one().unwrap().unwrap();
        assert_eq!((wc.wr_id(), wc.opcode(), wc.bytes()), (9, WcOpcode::Recv, 16));
        assert_eq!(&bytes(&b.mr)[..16], &[0xaa; 16]);
    }

    #[test]
    fn bad_rkey_is_remote_access_error() {
        let (_ctx, a, b) = connected(4);
        let mut remote = b.mr.as_remote().unwrap();
        remote.rkey ^= 0xffff;
        a.qp.write(&[a.mr.as_slice()], &remote, 1).unwrap();
        let wc = a.qp.scq().poll_one().unwrap().unwrap();
        assert_eq!(wc.status(), WcStatus::RemAccessErr);

        // Later requests are flushed.
        a.qp.write(&[a.mr.as_slice()], &b.mr.as_remote().unwrap(), 2).unwrap();
        let wc = a.qp.scq().poll_one().unwrap().unwrap();
        assert_eq!(wc.status(), WcStatus::WrFlushErr);
    }

    #[test]
    fn out_of_bounds_and_foreign_pd_are_rejected() {
        let (ctx, a, b) = connected(4);
        let remote = b.mr.as_remote().unwrap();
        a.qp.read(&[a.mr.as_slice()], &remote.slice(8, 56).unwrap(), 1)
            .unwrap();
        assert_eq!(
            a.qp.scq().poll_one().unwrap().unwrap().status(),
            WcStatus::RemAccessErr
        );

        // Region registered in a's PD, target QP lives in b's PD.
        let c = side(&ctx, Some(&a.pd), 4, 0);
        let d = side(&ctx, Some(&b.pd), 4, 0);
        Qp::bind_peers(&c.qp, &d.qp);
        c.qp.write(&[c.mr.as_slice()], &a.mr.as_remote().unwrap(), 1)
            .unwrap();
        assert_eq!(
            c.qp.scq().poll_one().unwrap().unwrap().status(),
            WcStatus::RemAccessErr
        );
    }

    #[test]
    fn signaled_sends_are_bounded_until_reaped() {
        let (_ctx, a, b) = connected(1);
        let remote = b.mr.as_remote().unwrap();
        a.qp.write(&[a.mr.as_slice()], &remote, 1).unwrap();
        assert!(matches!(
            a.qp.write(&[a.mr.as_slice()], &remote, 2),
            Err(PostError::QueueFull(1))
        ));
        a.qp.scq().poll_one().unwrap().unwrap();
        a.qp.write(&[a.mr.as_slice()], &remote, 3).unwrap();
    }

    #[test]
    fn recv_needs_init_and_flushes_on_error() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 4).unwrap();
        let qp = QpBuilder::new()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::with_depth(1))
            .build(&pd)
            .unwrap();
        let mut buf = [0u8; 16];
        let mr = unsafe { Mr::reg_raw(&pd, buf.as_mut_ptr(), 16, Permission::LOCAL_WRITE) }
            .unwrap();

        assert!(matches!(
            qp.recv(&[mr.as_slice()], 1),
            Err(PostError::InvalidState(QpState::Reset))
        ));
        qp.init();
        qp.recv(&[mr.as_slice()], 1).unwrap();
        assert!(matches!(
            qp.recv(&[mr.as_slice()], 2),
            Err(PostError::QueueFull(1))
        ));
        assert!(matches!(
            qp.send(&[mr.as_slice()], 3),
            Err(PostError::InvalidState(QpState::Init))
        ));

        qp.set_error();
        let wc = cq.poll_one().unwrap().unwrap();
        assert_eq!((wc.wr_id(), wc.status()), (1, WcStatus::WrFlushErr));
    }

    #[test]
    fn caps_are_checked() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let pd = Pd::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 4).unwrap();
        let err = QpBuilder::new()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps::with_depth(ctx.attr().max_qp_wr + 1))
            .build(&pd)
            .unwrap_err();
        assert!(matches!(err, QpCreationError::CapabilityNotEnough(..)));

        let err = QpBuilder::new().send_cq(&cq).build(&pd).unwrap_err();
        assert!(matches!(err, QpCreationError::MissingCq("recv")));
        assert_eq!(ctx.usage().qps, 0);
    }
}

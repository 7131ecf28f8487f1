//! Raw holders of libibverbs and librdmacm objects.
//!
//! Every holder destroys its object on drop. Holders that depend on another
//! object keep it alive, so destruction always runs in a valid order.

mod net;

use std::ffi::CStr;
use std::net::SocketAddr;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;
use std::{io, mem};

use self::net::SocketAddrCRepr;
use crate::bindings::*;
use crate::rdma::cm::ConnParam;
use crate::rdma::context::DeviceAttr;
use crate::rdma::cq::Wc;
use crate::rdma::qp::{QpCaps, QpState};
use crate::rdma::wr::{RecvWr, SendOp, SendWr};
use crate::utils::interop::{from_c_err, from_c_ret, from_errno};

macro_rules! impl_send_sync {
    ($($t:ty),*) => {
        $(
            // SAFETY: verbs objects can be used from any thread; libibverbs
            // and librdmacm serialize access internally.
            unsafe impl Send for $t {}
            unsafe impl Sync for $t {}
        )*
    };
}

impl_send_sync!(
    RawContext,
    RawPd,
    RawMr,
    RawCompChannel,
    RawCq,
    RawQp,
    RawEventChannel,
    RawCmEvent,
    RawCmId
);

/// Make a holder out of a pointer returned by a constructor verb, reading
/// `errno` on null.
fn non_null<T>(ptr: *mut T) -> io::Result<NonNull<T>> {
    NonNull::new(ptr).ok_or_else(io::Error::last_os_error)
}

/// Device context opened by librdmacm.
///
/// librdmacm keeps device contexts open until the process exits, so this
/// holder does not close it.
pub(crate) struct RawContext(NonNull<ibv_context>);

impl RawContext {
    /// # Safety
    ///
    /// `ctx` must be a context handed out by librdmacm.
    pub unsafe fn new(ctx: *mut ibv_context) -> Option<Self> {
        NonNull::new(ctx).map(Self)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_context {
        self.0.as_ptr()
    }

    /// Get the kernel name of the device.
    pub fn name(&self) -> String {
        // SAFETY: the context and its device stay valid; the name is a
        // NUL-terminated string owned by the device.
        unsafe {
            let name = ibv_get_device_name((*self.as_ptr()).device);
            if name.is_null() {
                return String::from("unknown");
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }

    /// Query the device capabilities.
    pub fn query(&self) -> io::Result<DeviceAttr> {
        let mut attr = ibv_device_attr::default();
        // SAFETY: FFI.
        from_c_err(unsafe { ibv_query_device(self.as_ptr(), &mut attr) })?;
        Ok(DeviceAttr {
            max_pd: attr.max_pd as u32,
            max_cq: attr.max_cq as u32,
            max_cqe: attr.max_cqe as u32,
            max_qp: attr.max_qp as u32,
            max_qp_wr: attr.max_qp_wr as u32,
            max_sge: attr.max_sge as u32,
            max_mr: attr.max_mr as u32,
            max_mr_size: attr.max_mr_size,
        })
    }
}

pub(crate) struct RawPd(NonNull<ibv_pd>);

impl RawPd {
    pub fn alloc(ctx: &RawContext) -> io::Result<Self> {
        // SAFETY: FFI.
        non_null(unsafe { ibv_alloc_pd(ctx.as_ptr()) }).map(Self)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_pd {
        self.0.as_ptr()
    }

    /// Get the kernel handle of the protection domain.
    pub fn handle(&self) -> u32 {
        // SAFETY: the PD is valid.
        unsafe { (*self.as_ptr()).handle }
    }
}

impl Drop for RawPd {
    fn drop(&mut self) {
        // SAFETY: FFI.
        if let Err(e) = from_c_err(unsafe { ibv_dealloc_pd(self.as_ptr()) }) {
            log::error!("rwbench: ibv_dealloc_pd failed: {}", e);
        }
    }
}

pub(crate) struct RawMr(NonNull<ibv_mr>);

impl RawMr {
    /// # Safety
    ///
    /// `[addr, addr + len)` must stay valid for the lifetime of the holder.
    pub unsafe fn reg(pd: &RawPd, addr: *mut u8, len: usize, access: u32) -> io::Result<Self> {
        non_null(ibv_reg_mr(pd.as_ptr(), addr.cast(), len, access as c_int)).map(Self)
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        // SAFETY: the MR is valid.
        unsafe { (*self.0.as_ptr()).lkey }
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        // SAFETY: the MR is valid.
        unsafe { (*self.0.as_ptr()).rkey }
    }
}

impl Drop for RawMr {
    fn drop(&mut self) {
        // SAFETY: FFI.
        if let Err(e) = from_c_err(unsafe { ibv_dereg_mr(self.0.as_ptr()) }) {
            log::error!("rwbench: ibv_dereg_mr failed: {}", e);
        }
    }
}

pub(crate) struct RawCompChannel(NonNull<ibv_comp_channel>);

impl RawCompChannel {
    pub fn create(ctx: &RawContext) -> io::Result<Self> {
        // SAFETY: FFI.
        non_null(unsafe { ibv_create_comp_channel(ctx.as_ptr()) }).map(Self)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_comp_channel {
        self.0.as_ptr()
    }

    /// Block until an armed CQ raises an event. Return the CQ.
    pub fn get_cq_event(&self) -> io::Result<*mut ibv_cq> {
        let mut cq = ptr::null_mut();
        let mut cq_context = ptr::null_mut::<c_void>();
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_get_cq_event(self.as_ptr(), &mut cq, &mut cq_context) })?;
        Ok(cq)
    }
}

impl Drop for RawCompChannel {
    fn drop(&mut self) {
        // SAFETY: FFI.
        if let Err(e) = from_c_err(unsafe { ibv_destroy_comp_channel(self.as_ptr()) }) {
            log::error!("rwbench: ibv_destroy_comp_channel failed: {}", e);
        }
    }
}

pub(crate) struct RawCq(NonNull<ibv_cq>);

impl RawCq {
    pub fn create(
        ctx: &RawContext,
        capacity: u32,
        channel: Option<&RawCompChannel>,
    ) -> io::Result<Self> {
        let channel = channel.map_or(ptr::null_mut(), RawCompChannel::as_ptr);
        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_ptr(),
                capacity as c_int,
                ptr::null_mut(),
                channel,
                0,
            )
        };
        non_null(cq).map(Self)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_cq {
        self.0.as_ptr()
    }

    /// Poll into `wc`. Return the number of entries written.
    pub fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        let mut raw = [ibv_wc::default(); 16];
        let mut polled = 0;
        while polled < wc.len() {
            let want = (wc.len() - polled).min(raw.len());
            // SAFETY: `raw` holds at least `want` entries.
            let n = unsafe { ibv_poll_cq(self.as_ptr(), want as c_int, raw.as_mut_ptr()) };
            if n < 0 {
                return Err(from_errno(-n));
            }
            let n = n as usize;
            for (slot, raw) in wc[polled..].iter_mut().zip(&raw[..n]) {
                *slot = Wc::from_raw(raw);
            }
            polled += n;
            if n < want {
                break;
            }
        }
        Ok(polled)
    }

    pub fn req_notify(&self) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_err(unsafe { ibv_req_notify_cq(self.as_ptr(), 0) })
    }

    pub fn ack_events(&self, num: u32) {
        // SAFETY: FFI.
        unsafe { ibv_ack_cq_events(self.as_ptr(), num) };
    }
}

impl Drop for RawCq {
    fn drop(&mut self) {
        // SAFETY: FFI.
        if let Err(e) = from_c_err(unsafe { ibv_destroy_cq(self.as_ptr()) }) {
            log::error!("rwbench: ibv_destroy_cq failed: {}", e);
        }
    }
}

/// Queue pair created on a connection manager identity.
pub(crate) struct RawQp {
    qp: NonNull<ibv_qp>,
    id: Arc<RawCmId>,
}

impl RawQp {
    pub fn create(
        id: &Arc<RawCmId>,
        pd: &RawPd,
        send_cq: &RawCq,
        recv_cq: &RawCq,
        caps: &QpCaps,
        sq_sig_all: bool,
    ) -> io::Result<Self> {
        let mut init_attr = ibv_qp_init_attr {
            send_cq: send_cq.as_ptr(),
            recv_cq: recv_cq.as_ptr(),
            cap: ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: 0,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: sq_sig_all as c_int,
            ..Default::default()
        };
        // SAFETY: FFI; the QP is moved to INIT by librdmacm.
        from_c_ret(unsafe { rdma_create_qp(id.as_ptr(), pd.as_ptr(), &mut init_attr) })?;
        let qp = non_null(id.qp())?;
        Ok(Self {
            qp,
            id: id.clone(),
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_qp {
        self.qp.as_ptr()
    }

    pub fn qp_num(&self) -> u32 {
        // SAFETY: the QP is valid.
        unsafe { (*self.as_ptr()).qp_num }
    }

    /// Query the current state.
    pub fn state(&self) -> io::Result<QpState> {
        let mut attr = ibv_qp_attr::default();
        let mut init_attr = ibv_qp_init_attr::default();
        let mask = ibv_qp_attr_mask::IBV_QP_STATE.0 as c_int;
        // SAFETY: FFI.
        from_c_err(unsafe { ibv_query_qp(self.as_ptr(), &mut attr, mask, &mut init_attr) })?;
        Ok(QpState::from_raw(attr.qp_state))
    }

    /// Move the queue pair to the error state.
    pub fn set_error(&self) -> io::Result<()> {
        let mut attr = ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_ERR,
            ..Default::default()
        };
        let mask = ibv_qp_attr_mask::IBV_QP_STATE.0 as c_int;
        // SAFETY: FFI.
        from_c_err(unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, mask) })
    }

    pub fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let (opcode, remote) = match wr.op {
            SendOp::Send => (ibv_wr_opcode::IBV_WR_SEND, None),
            SendOp::Write(remote) => (ibv_wr_opcode::IBV_WR_RDMA_WRITE, Some(remote)),
            SendOp::Read(remote) => (ibv_wr_opcode::IBV_WR_RDMA_READ, Some(remote)),
        };
        let mut raw = ibv_send_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            // `Sge` has the layout of `ibv_sge`; the provider only reads it.
            sg_list: wr.sgl.as_ptr() as *mut ibv_sge,
            num_sge: wr.sgl.len() as c_int,
            opcode,
            send_flags: if wr.signaled {
                ibv_send_flags::IBV_SEND_SIGNALED.0
            } else {
                0
            },
            ..Default::default()
        };
        if let Some(remote) = remote {
            // SAFETY: `rdma` is the active member for RDMA opcodes.
            unsafe {
                raw.wr.rdma.remote_addr = remote.addr;
                raw.wr.rdma.rkey = remote.rkey;
            }
        }
        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the request is copied into the send queue.
        from_c_err(unsafe { ibv_post_send(self.as_ptr(), &mut raw, &mut bad_wr) })
    }

    pub fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut raw = ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: wr.sgl.as_ptr() as *mut ibv_sge,
            num_sge: wr.sgl.len() as c_int,
        };
        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the request is copied into the receive queue.
        from_c_err(unsafe { ibv_post_recv(self.as_ptr(), &mut raw, &mut bad_wr) })
    }
}

impl Drop for RawQp {
    fn drop(&mut self) {
        // SAFETY: the identity still owns the QP.
        unsafe { rdma_destroy_qp(self.id.as_ptr()) };
    }
}

pub(crate) struct RawEventChannel(NonNull<rdma_event_channel>);

impl RawEventChannel {
    pub fn create() -> io::Result<Self> {
        // SAFETY: FFI.
        non_null(unsafe { rdma_create_event_channel() }).map(Self)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut rdma_event_channel {
        self.0.as_ptr()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        // SAFETY: the channel is valid.
        unsafe { (*self.as_ptr()).fd }
    }

    /// Wait until an event is ready. Return `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        loop {
            // SAFETY: FFI.
            let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
            match ret {
                0 => return Ok(false),
                n if n > 0 => return Ok(true),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Block until the next event arrives.
    pub fn get_event(&self) -> io::Result<RawCmEvent> {
        let mut event = ptr::null_mut();
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_get_cm_event(self.as_ptr(), &mut event) })?;
        non_null(event).map(RawCmEvent)
    }
}

impl Drop for RawEventChannel {
    fn drop(&mut self) {
        // SAFETY: FFI; every identity on the channel holds it alive.
        unsafe { rdma_destroy_event_channel(self.as_ptr()) };
    }
}

/// Event returned by `rdma_get_cm_event`. Acknowledged on drop.
pub(crate) struct RawCmEvent(NonNull<rdma_cm_event>);

impl RawCmEvent {
    fn get(&self) -> &rdma_cm_event {
        // SAFETY: the event is valid until acknowledged.
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub fn kind(&self) -> u32 {
        self.get().event
    }

    #[inline]
    pub fn status(&self) -> i32 {
        self.get().status
    }

    #[inline]
    pub fn id(&self) -> *mut rdma_cm_id {
        self.get().id
    }

    #[inline]
    pub fn listen_id(&self) -> *mut rdma_cm_id {
        self.get().listen_id
    }

    /// Connection parameters carried by a connection request.
    pub fn conn_param(&self) -> ConnParam {
        // SAFETY: `conn` is the active member for RC port spaces.
        let conn = unsafe { self.get().param.conn };
        ConnParam {
            responder_resources: conn.responder_resources,
            initiator_depth: conn.initiator_depth,
            retry_count: conn.retry_count,
            rnr_retry_count: conn.rnr_retry_count,
        }
    }

    pub fn ack(self) -> io::Result<()> {
        let event = self.0.as_ptr();
        mem::forget(self);
        // SAFETY: FFI; each event is acknowledged once.
        from_c_ret(unsafe { rdma_ack_cm_event(event) })
    }
}

impl Drop for RawCmEvent {
    fn drop(&mut self) {
        // SAFETY: FFI.
        unsafe { rdma_ack_cm_event(self.0.as_ptr()) };
    }
}

/// Connection manager identity. Destroyed on drop.
pub(crate) struct RawCmId {
    id: NonNull<rdma_cm_id>,
    _channel: Arc<RawEventChannel>,
}

impl RawCmId {
    pub fn create(channel: &Arc<RawEventChannel>) -> io::Result<Self> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        from_c_ret(unsafe {
            rdma_create_id(
                channel.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        })?;
        Ok(Self {
            id: non_null(id)?,
            _channel: channel.clone(),
        })
    }

    /// Take ownership of the identity of an incoming connection request.
    ///
    /// # Safety
    ///
    /// `id` must be the new identity of a `CONNECT_REQUEST` event on
    /// `channel`, and must not be owned elsewhere.
    pub unsafe fn adopt(id: *mut rdma_cm_id, channel: &Arc<RawEventChannel>) -> Option<Self> {
        NonNull::new(id).map(|id| Self {
            id,
            _channel: channel.clone(),
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut rdma_cm_id {
        self.id.as_ptr()
    }

    /// Device context the identity is bound to, once it has one.
    pub fn verbs(&self) -> *mut ibv_context {
        // SAFETY: the identity is valid.
        unsafe { (*self.as_ptr()).verbs }
    }

    pub fn qp(&self) -> *mut ibv_qp {
        // SAFETY: the identity is valid.
        unsafe { (*self.as_ptr()).qp }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        // SAFETY: FFI; the address lives in the identity.
        unsafe { net::from_c(rdma_get_local_addr(self.as_ptr())) }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        // SAFETY: FFI; the address lives in the identity.
        unsafe { net::from_c(rdma_get_peer_addr(self.as_ptr())) }
    }

    pub fn bind_addr(&self, addr: &SocketAddr) -> io::Result<()> {
        let mut addr = SocketAddrCRepr::new(addr);
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_bind_addr(self.as_ptr(), addr.as_mut_ptr()) })
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_listen(self.as_ptr(), backlog) })
    }

    pub fn resolve_addr(
        &self,
        src: Option<&SocketAddr>,
        dst: &SocketAddr,
        timeout_ms: u32,
    ) -> io::Result<()> {
        let mut src = src.map(SocketAddrCRepr::new);
        let src = src
            .as_mut()
            .map_or(ptr::null_mut(), SocketAddrCRepr::as_mut_ptr);
        let mut dst = SocketAddrCRepr::new(dst);
        // SAFETY: FFI; both addresses are copied by the call.
        from_c_ret(unsafe {
            rdma_resolve_addr(self.as_ptr(), src, dst.as_mut_ptr(), timeout_ms as c_int)
        })
    }

    pub fn resolve_route(&self, timeout_ms: u32) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_resolve_route(self.as_ptr(), timeout_ms as c_int) })
    }

    /// Set a one-byte identity-level option.
    pub fn set_option_u8(&self, name: c_int, value: u8) -> io::Result<()> {
        let mut value = value;
        // SAFETY: FFI; the value is copied by the call.
        from_c_ret(unsafe {
            rdma_set_option(
                self.as_ptr(),
                RDMA_OPTION_ID,
                name,
                &mut value as *mut u8 as *mut c_void,
                mem::size_of::<u8>(),
            )
        })
    }

    fn raw_param(param: &ConnParam) -> rdma_conn_param {
        rdma_conn_param {
            responder_resources: param.responder_resources,
            initiator_depth: param.initiator_depth,
            retry_count: param.retry_count,
            rnr_retry_count: param.rnr_retry_count,
            ..Default::default()
        }
    }

    pub fn connect(&self, param: &ConnParam) -> io::Result<()> {
        let mut param = Self::raw_param(param);
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_connect(self.as_ptr(), &mut param) })
    }

    pub fn accept(&self, param: &ConnParam) -> io::Result<()> {
        let mut param = Self::raw_param(param);
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_accept(self.as_ptr(), &mut param) })
    }

    pub fn reject(&self) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_reject(self.as_ptr(), ptr::null(), 0) })
    }

    pub fn disconnect(&self) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { rdma_disconnect(self.as_ptr()) })
    }
}

impl Drop for RawCmId {
    fn drop(&mut self) {
        // SAFETY: FFI; the queue pair, if any, was destroyed first.
        if let Err(e) = from_c_ret(unsafe { rdma_destroy_id(self.as_ptr()) }) {
            log::error!("rwbench: rdma_destroy_id failed: {}", e);
        }
    }
}

/// Count the RDMA devices of this host. Fails with `ENODEV` if there is none.
pub(crate) fn count_devices() -> io::Result<usize> {
    let mut n = 0;
    // SAFETY: FFI; the list is released right away, the contexts stay open.
    let list = unsafe { rdma_get_devices(&mut n) };
    if list.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: returned by `rdma_get_devices`.
    unsafe { rdma_free_devices(list) };
    if n <= 0 {
        return Err(from_errno(libc::ENODEV));
    }
    Ok(n as usize)
}

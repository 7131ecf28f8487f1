//! Bindings of libibverbs and librdmacm C interfaces.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod private {
    use libc::*;
    include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));
}

pub(crate) use self::private::*;

use std::os::raw::c_int;

/// `level` argument of `rdma_set_option` for identity-level options.
pub const RDMA_OPTION_ID: c_int = 0;

/// Type of service, `u8`.
pub const RDMA_OPTION_ID_TOS: c_int = 0;

/// Local ACK timeout exponent, `u8`.
pub const RDMA_OPTION_ID_ACK_TIMEOUT: c_int = 3;

/// Returned by the inline verbs below when the provider leaves the
/// operation unimplemented.
const NOT_SUPPORTED: c_int = libc::EOPNOTSUPP;

/// Poll a CQ for (possibly multiple) completions.
///
/// Returns a negative value on error, otherwise the number of completions
/// written to `wc`.
#[inline]
pub unsafe fn ibv_poll_cq(cq: *mut ibv_cq, num_entries: c_int, wc: *mut ibv_wc) -> c_int {
    match (*(*cq).context).ops.poll_cq {
        Some(poll_cq) => poll_cq(cq, num_entries, wc),
        None => -NOT_SUPPORTED,
    }
}

/// Request a completion notification on a CQ.
///
/// An event will be added to the completion channel associated with the CQ
/// when an entry is added to the CQ.
#[inline]
pub unsafe fn ibv_req_notify_cq(cq: *mut ibv_cq, solicited_only: c_int) -> c_int {
    match (*(*cq).context).ops.req_notify_cq {
        Some(req_notify_cq) => req_notify_cq(cq, solicited_only),
        None => NOT_SUPPORTED,
    }
}

/// Post a list of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> c_int {
    match (*(*qp).context).ops.post_send {
        Some(post_send) => post_send(qp, wr, bad_wr),
        None => NOT_SUPPORTED,
    }
}

/// Post a list of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> c_int {
    match (*(*qp).context).ops.post_recv {
        Some(post_recv) => post_recv(qp, wr, bad_wr),
        None => NOT_SUPPORTED,
    }
}

use std::fmt;

use thiserror::Error;

use crate::rdma::type_alias::{Qpn, WrId};

/// Opcode of a completion queue entry.
///
/// Discriminants follow `ibv_wc_opcode`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    #[default]
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// Receive request.
    Recv = 128,
}

/// Status of a completion queue entry.
///
/// Discriminants follow `ibv_wc_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// **Operation completed successfully:** the work request ended and the
    /// buffers it refers to are ready to be (re)used.
    #[default]
    #[error("success")]
    Success = 0,

    /// **Local Length Error:** a posted receive buffer is not big enough for
    /// the incoming message.
    #[error("local length error")]
    LocLenErr = 1,

    /// **Local QP Operation Error:** an internal QP consistency error was
    /// detected while processing this work request.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// **Local EE Context Operation Error:** an internal EE context
    /// consistency error was detected (RD only).
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// **Local Protection Error:** the scatter/gather list of a locally posted
    /// work request does not reference a memory region that is valid for the
    /// requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// **Work Request Flushed Error:** the work request was in process or
    /// outstanding when the QP transitioned into the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    /// **Memory Window Binding Error:** a failure happened when trying to
    /// bind a memory window to a memory region.
    #[error("memory window binding error")]
    MwBindErr = 6,

    /// **Bad Response Error:** an unexpected transport layer opcode was
    /// returned by the responder.
    #[error("bad response error")]
    BadRespErr = 7,

    /// **Local Access Error:** a protection error occurred on a local data
    /// buffer during the processing of an incoming RDMA write with immediate.
    #[error("local access error")]
    LocAccessErr = 8,

    /// **Remote Invalid Request Error:** the responder could not place an
    /// incoming send, e.g. because the posted receive buffer is too small.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// **Remote Access Error:** a protection error occurred on a remote data
    /// buffer to be read by an RDMA Read or written by an RDMA Write: unknown
    /// rkey, out-of-bounds range, missing permission or foreign protection
    /// domain.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// **Remote Operation Error:** the responder could not complete the
    /// operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// **Transport Retry Counter Exceeded:** the remote side did not answer,
    /// usually because the remote QP is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// **RNR Retry Counter Exceeded:** the remote side did not post any work
    /// request to its receive queue.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// **Local RDD Violation Error:** the RDD of the QP does not match the
    /// RDD of the EE context (RD only).
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// **Remote Invalid RD Request:** the responder detected an invalid
    /// incoming RD message (RD only).
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// **Remote Aborted Error:** the responder aborted the operation.
    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// **Invalid EE Context Number:** an invalid EE context number was
    /// detected (RD only).
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// **Invalid EE Context State Error:** the operation is not legal for the
    /// specified EE context state (RD only).
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    /// **Fatal error:** the device is gone.
    #[error("fatal error")]
    FatalErr = 19,

    /// **Response Timeout Error:** the responder did not answer in time.
    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// **General Error:** an error not covered by the other codes.
    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    /// Get the numeric `ibv_wc_status` value.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Convert a numeric `ibv_wc_status` value. Unknown values map to
    /// [`WcStatus::GeneralErr`].
    pub fn from_raw(code: u32) -> Self {
        use WcStatus::*;
        match code {
            0 => Success,
            1 => LocLenErr,
            2 => LocQpOpErr,
            3 => LocEecOpErr,
            4 => LocProtErr,
            5 => WrFlushErr,
            6 => MwBindErr,
            7 => BadRespErr,
            8 => LocAccessErr,
            9 => RemInvReqErr,
            10 => RemAccessErr,
            11 => RemOpErr,
            12 => RetryExcErr,
            13 => RnrRetryExcErr,
            14 => LocRddViolErr,
            15 => RemInvRdReqErr,
            16 => RemAbortErr,
            17 => InvEecnErr,
            18 => InvEecStateErr,
            19 => FatalErr,
            20 => RespTimeoutErr,
            _ => GeneralErr,
        }
    }
}

impl WcOpcode {
    /// Convert a numeric `ibv_wc_opcode` value. Opcodes this crate never
    /// posts are reported as `None`.
    pub fn from_raw(code: u32) -> Option<Self> {
        match code {
            0 => Some(WcOpcode::Send),
            1 => Some(WcOpcode::RdmaWrite),
            2 => Some(WcOpcode::RdmaRead),
            128 => Some(WcOpcode::Recv),
            _ => None,
        }
    }
}

/// Work completion entry, representing an entry polled from the completion
/// queue.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Wc {
    pub(crate) wr_id: WrId,
    pub(crate) status: WcStatus,
    pub(crate) opcode: WcOpcode,
    pub(crate) byte_len: u32,
    pub(crate) qp_num: Qpn,
}

impl Wc {
    #[cfg(feature = "verbs")]
    pub(crate) fn from_raw(wc: &crate::bindings::ibv_wc) -> Self {
        let status = WcStatus::from_raw(wc.status);
        Wc {
            wr_id: wc.wr_id,
            status,
            // The opcode is undefined on failed completions.
            opcode: if status == WcStatus::Success {
                WcOpcode::from_raw(wc.opcode).unwrap_or_default()
            } else {
                WcOpcode::default()
            },
            byte_len: wc.byte_len,
            qp_num: wc.qp_num,
        }
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is success, return the number of bytes processed or transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.bytes()),
            status => Err(status),
        }
    }

    /// Get the opcode of the work request.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }

    /// Get the number of the local QP this completion belongs to.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp_num
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_ibv_wc_status() {
        for code in 0..=21 {
            assert_eq!(WcStatus::from_raw(code).code(), code);
        }
        assert_eq!(WcStatus::from_raw(999), WcStatus::GeneralErr);
        assert_eq!(WcOpcode::from_raw(128), Some(WcOpcode::Recv));
        assert_eq!(WcOpcode::from_raw(3), None);
    }
}

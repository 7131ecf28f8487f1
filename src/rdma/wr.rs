//! Work requests.

use crate::rdma::mr::{MrRemote, Sge};
use crate::rdma::type_alias::WrId;

/// Operation carried by a send work request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SendOp {
    /// Two-sided send, consuming a receive posted by the peer.
    #[default]
    Send,
    /// One-sided write into the given remote memory.
    Write(MrRemote),
    /// One-sided read from the given remote memory.
    Read(MrRemote),
}

/// Send work request.
///
/// A request can be built once and posted many times.
#[derive(Clone, Debug, Default)]
pub struct SendWr {
    pub(crate) wr_id: WrId,
    pub(crate) op: SendOp,
    pub(crate) sgl: Vec<Sge>,
    pub(crate) signaled: bool,
}

impl SendWr {
    /// Create a new signaled send request with an empty scatter/gather list.
    pub fn new(wr_id: WrId) -> Self {
        Self {
            wr_id,
            signaled: true,
            ..Default::default()
        }
    }

    /// Set the work request ID.
    #[inline]
    pub fn set_id(&mut self, wr_id: WrId) -> &mut Self {
        self.wr_id = wr_id;
        self
    }

    /// Append an entry to the scatter/gather list.
    #[inline]
    pub fn push_sge(&mut self, sge: impl Into<Sge>) -> &mut Self {
        self.sgl.push(sge.into());
        self
    }

    /// Set whether the request generates a completion on success.
    #[inline]
    pub fn set_signaled(&mut self, signaled: bool) -> &mut Self {
        self.signaled = signaled;
        self
    }

    /// Set the work request to an RDMA send.
    #[inline]
    pub fn set_wr_send(&mut self) -> &mut Self {
        self.op = SendOp::Send;
        self
    }

    /// Set the work request to an RDMA write.
    #[inline]
    pub fn set_wr_write(&mut self, remote: MrRemote) -> &mut Self {
        self.op = SendOp::Write(remote);
        self
    }

    /// Set the work request to an RDMA read.
    #[inline]
    pub fn set_wr_read(&mut self, remote: MrRemote) -> &mut Self {
        self.op = SendOp::Read(remote);
        self
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the operation.
    #[inline]
    pub fn op(&self) -> &SendOp {
        &self.op
    }

    /// Total payload length of the scatter/gather list.
    pub fn total_len(&self) -> usize {
        self.sgl.iter().map(|sge| sge.length as usize).sum()
    }
}

/// Receive work request.
#[derive(Clone, Debug, Default)]
pub struct RecvWr {
    pub(crate) wr_id: WrId,
    pub(crate) sgl: Vec<Sge>,
}

impl RecvWr {
    /// Create a new receive request with an empty scatter/gather list.
    pub fn new(wr_id: WrId) -> Self {
        Self {
            wr_id,
            sgl: Vec::new(),
        }
    }

    /// Append an entry to the scatter/gather list.
    #[inline]
    pub fn push_sge(&mut self, sge: impl Into<Sge>) -> &mut Self {
        self.sgl.push(sge.into());
        self
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Total capacity of the scatter/gather list.
    pub fn total_len(&self) -> usize {
        self.sgl.iter().map(|sge| sge.length as usize).sum()
    }
}

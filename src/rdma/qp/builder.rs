use crate::rdma::cq::Cq;
use crate::rdma::pd::Pd;

use super::{Qp, QpCreationError};

/// Queue pair capability attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpCaps {
    /// The maximum number of outstanding signaled work requests that can be
    /// posted to the Send Queue in that Queue Pair.
    ///
    /// Value can be [1..`dev_cap.max_qp_wr`].
    pub max_send_wr: u32,

    /// The maximum number of outstanding work requests that can be posted to
    /// the Receive Queue in that Queue Pair.
    ///
    /// Value can be [1..`dev_cap.max_qp_wr`].
    pub max_recv_wr: u32,

    /// The maximum number of scatter/gather elements in any work request that
    /// can be posted to the Send Queue in that Queue Pair.
    ///
    /// Value can be [1..`dev_cap.max_sge`].
    pub max_send_sge: u32,

    /// The maximum number of scatter/gather elements in any work request that
    /// can be posted to the Receive Queue in that Queue Pair.
    ///
    /// Value can be [1..`dev_cap.max_sge`].
    pub max_recv_sge: u32,
}

impl Default for QpCaps {
    /// Generate a default RDMA queue pair capabilities setting.
    /// The queue pair capabilities are set to:
    /// - 128 outstanding send/recv work requests, and
    /// - 16 SGEs per send/recv work request.
    fn default() -> Self {
        QpCaps {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_send_sge: 16,
            max_recv_sge: 16,
        }
    }
}

impl QpCaps {
    /// Capabilities for a queue pair that keeps at most `depth` requests in
    /// flight on each queue, one SGE each.
    pub fn with_depth(depth: u32) -> Self {
        QpCaps {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// Queue pair builder.
#[derive(Clone, Debug)]
pub struct QpBuilder {
    /// Send completion queue for this QP.
    pub send_cq: Option<Cq>,

    /// Receive completion queue for this QP.
    pub recv_cq: Option<Cq>,

    /// Capabilities of this QP.
    pub caps: QpCaps,

    /// Whether to signal for all send work requests.
    pub sq_sig_all: bool,
}

impl Default for QpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QpBuilder {
    /// Create a new queue pair builder.
    pub fn new() -> Self {
        Self {
            send_cq: None,
            recv_cq: None,
            caps: QpCaps::default(),
            sq_sig_all: false,
        }
    }

    /// Set the send completion queue for this QP.
    pub fn send_cq(mut self, send_cq: &Cq) -> Self {
        self.send_cq = Some(send_cq.clone());
        self
    }

    /// Set the receive completion queue for this QP.
    pub fn recv_cq(mut self, recv_cq: &Cq) -> Self {
        self.recv_cq = Some(recv_cq.clone());
        self
    }

    /// Set the capabilities of this QP.
    pub fn caps(mut self, caps: QpCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Set whether to signal for all send work requests.
    pub fn sq_sig_all(mut self, sq_sig_all: bool) -> Self {
        self.sq_sig_all = sq_sig_all;
        self
    }

    /// Build the queue pair in the given protection domain.
    /// The QP starts in the `Reset` state.
    pub fn build(self, pd: &Pd) -> Result<Qp, QpCreationError> {
        Qp::new(pd, self)
    }
}

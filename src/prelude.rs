//! The RDMA prelude.
//!
//! The purpose of this module is to alleviate imports of common RDMA
//! functionalities.

pub use crate::rdma::cm::{CmEvent, CmEventType, CmId, ConnParam, EventChannel, PortSpace};
pub use crate::rdma::context::{Context, DeviceAttr};
pub use crate::rdma::cq::{CompChannel, Cq, Wc, WcStatus};
pub use crate::rdma::fabric::Fabric;
pub use crate::rdma::mr::{Mr, MrRemote, MrSlice, Permission};
pub use crate::rdma::pd::Pd;
pub use crate::rdma::qp::{Qp, QpBuilder, QpCaps};
pub use crate::rdma::wr::{RecvWr, SendWr};
pub use crate::wrap::{Backing, RegisteredMem};

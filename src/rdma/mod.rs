//! RDMA functionalities.
//!
//! Every resource type runs either on the in-process software device or,
//! with the `verbs` feature, on a real device through libibverbs and
//! librdmacm. Which one is decided by the [`fabric::Fabric`] the resources
//! descend from.

pub mod cm;
pub mod context;
pub mod cq;
pub mod fabric;
pub mod mr;
pub mod pd;
pub mod qp;
pub mod type_alias;
#[cfg(feature = "verbs")]
pub(crate) mod verbs;
pub mod wr;

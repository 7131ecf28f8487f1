//! A remote write/read latency and throughput benchmark over reliable
//! connected RDMA queue pairs.
//!
//! The transport is a verbs-shaped API with `Arc`-based resource types. A
//! [`Fabric`] backs it either with real RDMA devices through libibverbs and
//! librdmacm (the `verbs` feature, see `Fabric::verbs`) or with an
//! in-process software device used by the tests. All RDMA resource holder types
//! ([`Context`], [`Pd`], [`Cq`], [`Qp`], and [`CmId`]) should be viewed as
//! references to the true underlying resources; share them simply by
//! `clone()`-ing. Connections are managed the `rdma_cm` way: identities
//! report events on an [`EventChannel`] that the owner must acknowledge.
//!
//! The benchmark itself lives in [`bench`]: a [`bench::Server`] advertises one
//! registered region per connection, and a [`bench::Client`] drives one worker
//! per connection, each timing a remote write followed by a remote read.
//!
//! # Example
//!
//! ```rust
//! use rwbench::prelude::*;
//! use rwbench::bench::{BenchConfig, Client, Server};
//!
//! fn main() -> anyhow::Result<()> {
//!     let fabric = Fabric::new("soft0", DeviceAttr::default());
//!     let config = BenchConfig {
//!         duration_ms: 20,
//!         prepare_ms: 0,
//!         ..Default::default()
//!     };
//!     let addrs = rwbench::bench::addr::resolve(None, "127.0.0.1", config.port)?;
//!
//!     let mut server = Server::bind(&fabric, &config, addrs.dst)?;
//!     let report = std::thread::scope(|s| {
//!         let srv = s.spawn(|| server.run());
//!         let report = Client::new(&fabric, &config, addrs)?.run();
//!         srv.join().expect("server thread panicked")?;
//!         report
//!     })?;
//!     assert!(report.ops > 0);
//!     Ok(())
//! }
//! ```

pub mod bench;
pub mod ctrl;
pub mod prelude;
pub mod rdma;
pub mod wrap;

#[cfg(feature = "verbs")]
mod bindings;
mod utils;

pub use rdma::cm::{CmEvent, CmEventType, CmId, ConnParam, EventChannel, PortSpace};
pub use rdma::context::{Context, DeviceAttr};
pub use rdma::cq::{CompChannel, Cq, Wc, WcOpcode, WcStatus};
pub use rdma::fabric::Fabric;
pub use rdma::mr::{Mr, MrRemote, MrSlice, Permission};
pub use rdma::pd::Pd;
pub use rdma::qp::{Qp, QpBuilder, QpCaps, QpState};
pub use rdma::wr::{RecvWr, SendWr};

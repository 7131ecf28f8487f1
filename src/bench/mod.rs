//! The remote write/read benchmark.
//!
//! A [`Server`] accepts connections and advertises one registered region per
//! connection; a [`Client`] connects, learns each region's descriptor, and
//! runs one worker per connection that alternates a remote write and a
//! remote read against it. Both sides are driven by an [`Endpoint`], a
//! single-threaded loop over connection manager events.

pub mod addr;
mod client;
mod config;
mod conn;
mod context;
mod endpoint;
mod engine;
mod error;
pub mod report;
mod resources;
mod server;
mod stats;
mod worker;

pub use client::Client;
pub use config::BenchConfig;
pub use conn::{ConnArena, ConnRegions, Connection};
pub use context::BenchContext;
pub use endpoint::{Endpoint, Quota};
pub use engine::{CompletionEngine, ReapMode};
pub use error::BenchError;
pub use report::{render, ReportFormat};
pub use resources::{RegionId, ResourceOpts, ResourceSet};
pub use server::{Server, ServerSummary};
pub use stats::{aggregate, BenchReport, WorkerRow, WorkerStats};
pub use worker::{run_workers, WorkerJob};

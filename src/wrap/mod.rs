//! Owned memory wrappers around memory regions.

mod durable;
mod registered_mem;

pub use durable::DurableFile;
pub use registered_mem::{Backing, RegisteredMem};

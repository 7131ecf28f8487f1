//! Type aliases for RDMA-related identifiers.

/// QP number (QPN) is a [`u32`] that identifies a local queue pair.
pub type Qpn = u32;

/// Local key (LKey) is a [`u32`] that identifies a local memory region.
pub type LKey = u32;

/// Remote key (RKey) is a [`u32`] that authorizes remote access to a memory region.
pub type RKey = u32;

/// Work request Identifier (WrId) is a [`u64`] that can be designated by the user to identify a work request.
pub type WrId = u64;

/// Protection domain number (PdNum) is a [`u32`] that identifies a protection domain on a device.
pub type PdNum = u32;

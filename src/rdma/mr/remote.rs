use serde::{Deserialize, Serialize};

use crate::rdma::type_alias::RKey;

/// Remote registered memory.
///
/// This structure contains remote memory region information and does not hold
/// any RDMA resources locally. It can also represent a part of a remote memory
/// region by letting `addr` and `len` correspond to that part only.
///
/// The descriptor is valid only while the connection that produced it lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrRemote {
    pub addr: u64,
    pub len: usize,
    pub rkey: RKey,
}

impl MrRemote {
    /// Create a new piece of remote registered memory data.
    pub fn new(addr: u64, len: usize, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }

    /// Create a dummy `MrRemote` with all fields set to zero.
    pub fn dummy() -> Self {
        Self::new(0, 0, 0)
    }

    /// Get a pointer at the given offset.
    #[inline]
    pub fn at(&self, offset: usize) -> u64 {
        self.addr + offset as u64
    }

    /// Get a sub-range of this remote memory.
    /// Return `None` if the range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Self> {
        if offset <= self.len && len <= self.len - offset {
            Some(Self::new(self.at(offset), len, self.rkey))
        } else {
            None
        }
    }
}

impl Default for MrRemote {
    /// Create a dummy `MrRemote` with all fields set to zero.
    fn default() -> Self {
        Self::dummy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_bounds() {
        let r = MrRemote::new(0x1000, 64, 7);
        assert_eq!(r.slice(16, 48), Some(MrRemote::new(0x1010, 48, 7)));
        assert_eq!(r.slice(16, 49), None);
        assert_eq!(r.slice(64, 0).map(|s| s.addr), Some(0x1040));
    }
}

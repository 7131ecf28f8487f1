use super::Mr;
use crate::rdma::type_alias::LKey;

/// Slice of a local memory region.
///
/// A slice corresponds to an RDMA scatter-gather list entry, which can be used
/// in RDMA data-plane verbs.
///
/// **Subtyping:** [`MrSlice<'a>`] is *covariant* over `'a`.
#[derive(Clone, Copy)]
pub struct MrSlice<'a> {
    mr: &'a Mr,
    offset: usize,
    len: usize,
}

impl<'a> MrSlice<'a> {
    /// Create a new memory region slice of the given MR, offset, and length.
    pub(crate) fn new(mr: &'a Mr, offset: usize, len: usize) -> Self {
        Self { mr, offset, len }
    }

    /// Get the underlying `Mr`.
    #[inline]
    pub fn mr(&self) -> &Mr {
        self.mr
    }

    /// Get the starting address of the slice.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        (self.mr.addr() as usize + self.offset) as *mut u8
    }

    /// Get the offset of the slice within its memory region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Get the length of the slice.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Attempt to resize the memory region slice to the specified length.
    /// This attempt has no effect if the desired length is greater
    /// than the largest possible length of the slice.
    /// Return whether the resize was successful.
    #[must_use = "must check if the resize was successful"]
    #[inline]
    pub fn resize(&mut self, len: usize) -> bool {
        let max_len = self.mr.len() - self.offset;
        if len <= max_len {
            self.len = len;
            true
        } else {
            false
        }
    }
}

/// Scatter/gather entry: a local buffer referenced by a work request.
///
/// Layout matches `ibv_sge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

impl From<MrSlice<'_>> for Sge {
    fn from(slice: MrSlice<'_>) -> Self {
        Self {
            addr: slice.addr() as u64,
            length: slice.len() as u32,
            lkey: slice.mr.lkey(),
        }
    }
}

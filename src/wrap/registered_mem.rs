use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::{fmt, io};

use super::durable::DurableFile;
use crate::rdma::mr::*;
use crate::rdma::pd::Pd;

/// Where the memory of a [`RegisteredMem`] comes from.
#[derive(Clone, Debug)]
pub enum Backing {
    /// A zeroed heap allocation of the given length.
    Heap { len: usize },
    /// A slice of a mapped durable file.
    Durable {
        file: Arc<DurableFile>,
        offset: usize,
        len: usize,
    },
}

impl Backing {
    /// Get the length of the backing memory.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Backing::Heap { len } | Backing::Durable { len, .. } => *len,
        }
    }
}

/// Leaked `Box<[u8]>`, reclaimed on drop.
struct HeapBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl HeapBuf {
    fn zeroed(len: usize) -> Self {
        let buf = vec![0u8; len].into_boxed_slice();
        Self {
            ptr: NonNull::from(Box::leak(buf)).cast::<u8>(),
            len,
        }
    }
}

impl Drop for HeapBuf {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `Box::leak` with this length.
        drop(unsafe {
            Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len))
        });
    }
}

enum Storage {
    Heap(HeapBuf),
    /// Keeps the mapping alive.
    Durable(Arc<DurableFile>),
}

/// A wrapper around an owned memory area that is registered as an RDMA MR.
///
/// Heap memory is deallocated, and durable mappings are released, when this
/// structure is dropped. The memory region is always deregistered before
/// its memory goes away.
pub struct RegisteredMem {
    /// The memory region, dropped first.
    mr: Mr,

    /// The memory, dropped after the `Mr`.
    storage: Storage,
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: the memory is exclusively owned and only accessed through copies.
unsafe impl Send for RegisteredMem {}
unsafe impl Sync for RegisteredMem {}

impl fmt::Debug for RegisteredMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMem")
            .field("mr", &self.mr)
            .field("durable", &self.is_durable())
            .finish()
    }
}

impl RegisteredMem {
    /// Obtain memory as described by `backing` and register it with `pd`.
    pub fn new(pd: &Pd, backing: Backing, perm: Permission) -> Result<Self, RegistrationError> {
        match backing {
            Backing::Heap { len } => {
                let buf = HeapBuf::zeroed(len);
                let addr = buf.ptr;
                // SAFETY: the allocation lives until `self` is dropped, after the MR.
                let mr = unsafe { Mr::reg_raw(pd, addr.as_ptr(), len, perm) }?;
                Ok(Self {
                    mr,
                    storage: Storage::Heap(buf),
                    addr,
                    len,
                })
            }
            Backing::Durable { file, offset, len } => {
                if offset > file.len() || len > file.len() - offset {
                    return Err(RegistrationError::IoError(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "range {}+{} exceeds durable file of {} bytes",
                            offset,
                            len,
                            file.len()
                        ),
                    )));
                }
                // SAFETY: in bounds, checked above.
                let addr = unsafe { file.as_ptr().add(offset) };
                // SAFETY: the mapping lives until `self` is dropped, after the MR.
                let mr = unsafe { Mr::reg_raw(pd, addr, len, perm) }?;
                Ok(Self {
                    mr,
                    addr: NonNull::new(addr).ok_or(RegistrationError::NullAddress)?,
                    storage: Storage::Durable(file),
                    len,
                })
            }
        }
    }

    /// Allocate zeroed heap memory with the given length and register MR on it.
    pub fn heap(pd: &Pd, len: usize, perm: Permission) -> Result<Self, RegistrationError> {
        Self::new(pd, Backing::Heap { len }, perm)
    }

    /// Allocate memory that shares the same length and content with the provided
    /// slice, and then register MR on it.
    pub fn new_with_content(
        pd: &Pd,
        content: &[u8],
        perm: Permission,
    ) -> Result<Self, RegistrationError> {
        let ret = Self::heap(pd, content.len(), perm)?;
        ret.write_at(0, content);
        Ok(ret)
    }

    /// Get the memory region.
    #[inline]
    pub fn mr(&self) -> &Mr {
        &self.mr
    }

    /// Get the address of the memory.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get the length of the memory.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the memory lives in a durable file.
    #[inline]
    pub fn is_durable(&self) -> bool {
        matches!(self.storage, Storage::Durable(_))
    }

    /// Get a `MrSlice` that represents the whole memory region.
    #[inline]
    pub fn as_slice(&self) -> MrSlice<'_> {
        self.mr.as_slice()
    }

    /// Get a memory region slice. Return `None` if the range is out of bounds.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> Option<MrSlice<'_>> {
        self.mr.slice(offset, len)
    }

    /// View the memory as a remote memory region for peers.
    /// Return `None` if the region grants no remote access.
    #[inline]
    pub fn as_remote(&self) -> Option<MrRemote> {
        self.mr.as_remote()
    }

    /// Copy the current content out.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: in bounds; the memory may be concurrently written by the
        // device, so it is copied rather than borrowed.
        unsafe { ptr::copy(self.addr(), out.as_mut_ptr(), self.len) };
        out
    }

    /// Copy `data` into the memory at `offset`, truncated to fit.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        if offset >= self.len {
            return;
        }
        let n = data.len().min(self.len - offset);
        // SAFETY: in bounds, checked above.
        unsafe { ptr::copy(data.as_ptr(), self.addr().add(offset), n) };
    }

    /// Fill the whole memory with `byte`.
    pub fn fill(&self, byte: u8) {
        // SAFETY: in bounds.
        unsafe { ptr::write_bytes(self.addr(), byte, self.len) };
    }

    /// Flush durable memory to its file. No-op for heap memory.
    pub fn persist(&self) -> io::Result<()> {
        match &self.storage {
            Storage::Heap(_) => Ok(()),
            Storage::Durable(file) => {
                let offset = self.addr() as usize - file.as_ptr() as usize;
                file.persist(offset, self.len)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::{Context, DeviceAttr};

    #[test]
    fn heap_memory_roundtrip() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let pd = Pd::new(&ctx).unwrap();
        let mem = RegisteredMem::new_with_content(&pd, b"hello", Permission::default()).unwrap();
        assert_eq!(mem.snapshot(), b"hello");
        mem.write_at(3, b"p!!!");
        assert_eq!(mem.snapshot(), b"help!");
        assert!(!mem.is_durable());
        mem.persist().unwrap();

        let remote = mem.as_remote().unwrap();
        assert_eq!((remote.addr, remote.len), (mem.addr() as u64, 5));
        drop(mem);
        assert_eq!(ctx.usage().mrs, 0);
    }

    #[test]
    fn durable_slices() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let pd = Pd::new(&ctx).unwrap();
        let path = std::env::temp_dir().join(format!("rwbench-regmem-{}", std::process::id()));
        let file = Arc::new(DurableFile::create(&path, 256).unwrap());

        let a = RegisteredMem::new(
            &pd,
            Backing::Durable { file: file.clone(), offset: 0, len: 100 },
            Permission::default(),
        )
        .unwrap();
        let b = RegisteredMem::new(
            &pd,
            Backing::Durable { file: file.clone(), offset: 100, len: 100 },
            Permission::default(),
        )
        .unwrap();
        assert!(a.is_durable());
        assert_eq!(b.addr() as usize - a.addr() as usize, 100);
        b.fill(7);
        b.persist().unwrap();

        assert!(RegisteredMem::new(
            &pd,
            Backing::Durable { file: file.clone(), offset: 200, len: 100 },
            Permission::default(),
        )
        .is_err());

        drop((a, b, file));
        std::fs::remove_file(&path).unwrap();
    }
}

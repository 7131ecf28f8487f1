use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::{fmt, io};

use crate::utils::interop::from_c_ret;

/// A file mapped shared into memory, typically on a DAX-capable
/// persistent-memory file system.
///
/// Stores through the mapping reach the file; [`DurableFile::persist`]
/// flushes them. The mapping is removed on drop.
pub struct DurableFile {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
    _file: File,
}

// SAFETY: the mapping is plain shared memory owned by this value.
unsafe impl Send for DurableFile {}
unsafe impl Sync for DurableFile {}

impl fmt::Debug for DurableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: FFI.
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as usize
    } else {
        4096
    }
}

impl DurableFile {
    fn map(file: File, path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        // SAFETY: FFI; the descriptor is valid and the length non-zero.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)?;
        log::debug!("rwbench: mapped {} ({} bytes)", path.display(), len);

        Ok(Self {
            ptr,
            len,
            path: path.to_owned(),
            _file: file,
        })
    }

    /// Map an existing file in full.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        Self::map(file, path, len)
    }

    /// Create (or truncate) a file of `len` bytes and map it.
    pub fn create(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map(file, path, len)
    }

    /// Get the start address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the length of the mapping.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the path of the mapped file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush `[offset, offset + len)` of the mapping to the file.
    pub fn persist(&self, offset: usize, len: usize) -> io::Result<()> {
        if offset > self.len || len > self.len - offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "persist range out of bounds",
            ));
        }
        let start = offset - offset % page_size();
        // SAFETY: FFI; the page-aligned range lies within the mapping.
        let ret = unsafe {
            libc::msync(
                self.as_ptr().add(start).cast(),
                len + (offset - start),
                libc::MS_SYNC,
            )
        };
        from_c_ret(ret)
    }
}

impl Drop for DurableFile {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `map` and is unmapped once.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("rwbench: cannot unmap {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_persist_reopen() {
        let path = std::env::temp_dir().join(format!("rwbench-durable-{}", std::process::id()));
        {
            let file = DurableFile::create(&path, 8192).unwrap();
            assert_eq!(file.len(), 8192);
            unsafe { ptr::write_bytes(file.as_ptr().add(5000), 0x5a, 100) };
            file.persist(5000, 100).unwrap();
            assert!(file.persist(8000, 500).is_err());
        }
        let file = DurableFile::open(&path).unwrap();
        assert_eq!(unsafe { *file.as_ptr().add(5050) }, 0x5a);
        drop(file);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_file_is_refused() {
        let path = std::env::temp_dir().join(format!("rwbench-empty-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        assert!(DurableFile::open(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}

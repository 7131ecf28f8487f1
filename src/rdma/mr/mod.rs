mod mr_slice;
mod perm;
mod remote;

use std::{fmt, io};

use thiserror::Error;

pub use self::mr_slice::*;
pub use self::perm::*;
pub use self::remote::*;
use super::context::{MrEntry, ResourceKind};
use super::pd::Pd;
use super::type_alias::*;
#[cfg(feature = "verbs")]
use super::verbs::RawMr;

/// Memory region registration error type.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The device refused the registration.
    #[error("I/O error from device")]
    IoError(#[from] io::Error),

    /// The area is larger than the device supports.
    /// The two fields are the requested length and the maximum supported.
    #[error("memory region too large: {0} bytes requested, up to {1} supported")]
    TooLarge(usize, u64),

    /// The area starts at a null pointer.
    #[error("cannot register memory at a null address")]
    NullAddress,
}

/// Local memory region.
///
/// A memory region is a virtual memory space registered to the RDMA device.
/// The registered memory itself does not belong to this type, but it must
/// outlive it or there can be dangling pointers. The region is deregistered
/// on drop.
pub struct Mr {
    #[cfg(feature = "verbs")]
    raw: Option<RawMr>,
    pd: Pd,
    addr: usize,
    len: usize,
    perm: Permission,
    lkey: LKey,
    rkey: Option<RKey>,
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &(self.addr as *const u8))
            .field("len", &self.len)
            .field("lkey", &self.lkey)
            .field("rkey", &self.rkey)
            .finish()
    }
}

impl Mr {
    /// Register a memory area with the given protection domain.
    ///
    /// # Safety
    ///
    /// The area `[addr, addr + len)` must be valid for reads and writes for
    /// the whole lifetime of the returned `Mr`, and must not be accessed
    /// through Rust references while remote peers may be writing to it.
    pub unsafe fn reg_raw(
        pd: &Pd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> Result<Self, RegistrationError> {
        let ctx = pd.context();
        if addr.is_null() {
            return Err(RegistrationError::NullAddress);
        }
        if len as u64 > ctx.attr().max_mr_size {
            return Err(RegistrationError::TooLarge(len, ctx.attr().max_mr_size));
        }
        ctx.acquire(ResourceKind::Mr)?;

        #[cfg(feature = "verbs")]
        if let Some(raw_pd) = pd.raw() {
            let raw = match RawMr::reg(raw_pd, addr, len, perm.bits()) {
                Ok(raw) => raw,
                Err(e) => {
                    ctx.release(ResourceKind::Mr);
                    return Err(e.into());
                }
            };
            log::trace!(
                "rwbench: ibv_reg_mr {:p}+{} lkey={:#x} rkey={:#x}",
                addr,
                len,
                raw.lkey(),
                raw.rkey()
            );
            return Ok(Self {
                pd: pd.clone(),
                addr: addr as usize,
                len,
                perm,
                lkey: raw.lkey(),
                rkey: perm.has_remote_access().then(|| raw.rkey()),
                raw: Some(raw),
            });
        }

        let (lkey, rkey) = ctx.insert_mr(MrEntry {
            addr: addr as usize,
            len,
            perm,
            pd: pd.pdn(),
        });
        log::trace!(
            "rwbench: reg MR {:p}+{} lkey={:#x} rkey={:?}",
            addr,
            len,
            lkey,
            rkey
        );
        Ok(Self {
            #[cfg(feature = "verbs")]
            raw: None,
            pd: pd.clone(),
            addr: addr as usize,
            len,
            perm,
            lkey,
            rkey,
        })
    }

    /// Get the protection domain this region is registered in.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Get the length of the registered memory area.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the access permissions of the memory region.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.perm
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    /// Get the remote key of the memory region.
    /// Only regions that grant remote access have one.
    #[inline]
    pub fn rkey(&self) -> Option<RKey> {
        self.rkey
    }

    /// Get a slice that represents the entire memory region.
    #[inline]
    pub fn as_slice(&self) -> MrSlice<'_> {
        MrSlice::new(self, 0, self.len)
    }

    /// Get a slice from an offset and a length.
    /// Return `None` if the range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<MrSlice<'_>> {
        if offset <= self.len && len <= self.len - offset {
            Some(MrSlice::new(self, offset, len))
        } else {
            None
        }
    }

    /// View this local memory region as a remote memory region for RDMA access
    /// from remote peers. Return `None` if the region grants no remote access.
    #[inline]
    pub fn as_remote(&self) -> Option<MrRemote> {
        self.rkey
            .map(|rkey| MrRemote::new(self.addr as u64, self.len, rkey))
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        let ctx = self.pd.context();
        #[cfg(feature = "verbs")]
        drop(self.raw.take());
        if ctx.is_soft() {
            ctx.remove_mr(self.lkey, self.rkey);
        }
        ctx.release(ResourceKind::Mr);
        log::trace!("rwbench: dereg MR lkey={:#x}", self.lkey);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::{Context, DeviceAttr};

    #[test]
    fn reg_and_dereg() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let pd = Pd::new(&ctx).unwrap();
        let mut buf = vec![0u8; 128];

        let mr = unsafe { Mr::reg_raw(&pd, buf.as_mut_ptr(), buf.len(), Permission::default()) }
            .unwrap();
        let remote = mr.as_remote().unwrap();
        assert_eq!(remote.addr, buf.as_ptr() as u64);
        assert_eq!(remote.len, 128);
        assert_eq!(ctx.usage().mrs, 1);
        assert!(mr.slice(64, 65).is_none());

        drop(mr);
        assert_eq!(ctx.usage().mrs, 0);
        assert!(ctx.mr_table().remote(remote.rkey).is_none());
    }

    #[test]
    fn local_only_region_has_no_remote_view() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let pd = Pd::new(&ctx).unwrap();
        let mut buf = [0u8; 16];
        let mr = unsafe { Mr::reg_raw(&pd, buf.as_mut_ptr(), 16, Permission::LOCAL_WRITE) }
            .unwrap();
        assert!(mr.rkey().is_none());
        assert!(mr.as_remote().is_none());
    }

    #[test]
    fn oversized_region_is_refused() {
        let ctx = Context::open_soft(
            "soft0",
            DeviceAttr {
                max_mr_size: 8,
                ..Default::default()
            },
        );
        let pd = Pd::new(&ctx).unwrap();
        let mut buf = [0u8; 16];
        let err = unsafe { Mr::reg_raw(&pd, buf.as_mut_ptr(), 16, Permission::default()) }
            .unwrap_err();
        assert!(matches!(err, RegistrationError::TooLarge(16, 8)));
    }
}

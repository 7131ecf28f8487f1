use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::{fmt, io};

use crate::rdma::mr::Permission;
use crate::rdma::type_alias::*;
#[cfg(feature = "verbs")]
use crate::rdma::verbs::RawContext;
use crate::utils::interop::from_errno;
use crate::utils::sync::{lock, read, write};

/// Device capabilities.
///
/// Every limit here is enforced before a resource reaches the device:
/// allocations beyond them fail with `ENOMEM` (resource counts) or `EINVAL`
/// (sizes). Real devices report theirs with `ibv_query_device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttr {
    /// Maximum number of protection domains.
    pub max_pd: u32,
    /// Maximum number of completion queues.
    pub max_cq: u32,
    /// Maximum number of entries of a single completion queue.
    pub max_cqe: u32,
    /// Maximum number of queue pairs.
    pub max_qp: u32,
    /// Maximum number of outstanding work requests on a single queue.
    pub max_qp_wr: u32,
    /// Maximum number of scatter/gather entries in a work request.
    pub max_sge: u32,
    /// Maximum number of memory regions.
    pub max_mr: u32,
    /// Maximum size of a memory region in bytes.
    pub max_mr_size: u64,
}

impl Default for DeviceAttr {
    fn default() -> Self {
        Self {
            max_pd: 1024,
            max_cq: 4096,
            max_cqe: 4096,
            max_qp: 4096,
            max_qp_wr: 1024,
            max_sge: 16,
            max_mr: 16384,
            max_mr_size: 1 << 40,
        }
    }
}

/// Number of live resources allocated on a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub pds: u32,
    pub cqs: u32,
    pub qps: u32,
    pub mrs: u32,
}

impl ResourceUsage {
    /// Whether no resources are allocated.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Counted resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    Pd,
    Cq,
    Qp,
    Mr,
}

/// Registration record of a memory region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MrEntry {
    pub addr: usize,
    pub len: usize,
    pub perm: Permission,
    pub pd: PdNum,
}

impl MrEntry {
    /// Check whether `[addr, addr + len)` lies within the registered area.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let start = self.addr as u64;
        let end = start + self.len as u64;
        addr >= start && addr <= end && (end - addr) >= len as u64
    }
}

/// Memory region table of a device, indexed by both keys.
#[derive(Default)]
pub(crate) struct MrTable {
    by_lkey: HashMap<LKey, MrEntry>,
    by_rkey: HashMap<RKey, LKey>,
}

impl MrTable {
    /// Look up a region by its local key.
    pub fn local(&self, lkey: LKey) -> Option<&MrEntry> {
        self.by_lkey.get(&lkey)
    }

    /// Look up a region by its remote key.
    pub fn remote(&self, rkey: RKey) -> Option<&MrEntry> {
        self.by_rkey.get(&rkey).and_then(|lkey| self.by_lkey.get(lkey))
    }
}

struct ContextInner {
    #[cfg(feature = "verbs")]
    raw: Option<RawContext>,
    name: String,
    attr: DeviceAttr,
    removed: AtomicBool,
    usage: Mutex<ResourceUsage>,
    mrs: RwLock<MrTable>,
    next_key: AtomicU32,
    next_qpn: AtomicU32,
    next_pdn: AtomicU32,
}

/// Device context.
///
/// This type is a simple wrapper of an `Arc`; clones refer to the same device.
/// A software context executes work requests posted to its queue pairs
/// directly against registered memory. Both sides of a loopback connection
/// usually share one, just like two processes sharing a single HCA. A
/// hardware context wraps the `ibv_context` librdmacm opened for a device.
#[derive(Clone)]
#[repr(transparent)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("removed", &self.is_removed())
            .finish()
    }
}

impl Context {
    /// Open a software device with the given name and capabilities.
    pub fn open_soft(name: &str, attr: DeviceAttr) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                #[cfg(feature = "verbs")]
                raw: None,
                name: name.to_owned(),
                attr,
                removed: AtomicBool::new(false),
                usage: Mutex::new(ResourceUsage::default()),
                mrs: RwLock::new(MrTable::default()),
                next_key: AtomicU32::new(0x1000),
                next_qpn: AtomicU32::new(0x100),
                next_pdn: AtomicU32::new(1),
            }),
        }
    }

    /// Wrap a device context opened by librdmacm.
    #[cfg(feature = "verbs")]
    pub(crate) fn open_verbs(raw: RawContext) -> io::Result<Self> {
        let attr = raw.query()?;
        let name = raw.name();
        log::debug!("rwbench: opened device {} ({:?})", name, attr);
        Ok(Self {
            inner: Arc::new(ContextInner {
                name,
                attr,
                raw: Some(raw),
                removed: AtomicBool::new(false),
                usage: Mutex::new(ResourceUsage::default()),
                mrs: RwLock::new(MrTable::default()),
                next_key: AtomicU32::new(0),
                next_qpn: AtomicU32::new(0),
                next_pdn: AtomicU32::new(0),
            }),
        })
    }

    /// Get the hardware context, if this is not a software device.
    #[cfg(feature = "verbs")]
    #[inline]
    pub(crate) fn raw(&self) -> Option<&RawContext> {
        self.inner.raw.as_ref()
    }

    /// Whether this is the in-process software device.
    #[inline]
    pub fn is_soft(&self) -> bool {
        #[cfg(feature = "verbs")]
        if self.inner.raw.is_some() {
            return false;
        }
        true
    }

    /// Get the device name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the device capabilities.
    #[inline]
    pub fn attr(&self) -> &DeviceAttr {
        &self.inner.attr
    }

    /// Get the number of currently allocated resources.
    pub fn usage(&self) -> ResourceUsage {
        *lock(&self.inner.usage)
    }

    /// Whether the device has been removed.
    #[inline]
    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }

    /// Whether two contexts refer to the same device.
    #[inline]
    pub fn same_device(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mark_removed(&self) {
        self.inner.removed.store(true, Ordering::Release);
    }

    /// Fail with `ENODEV` if the device has been removed.
    pub(crate) fn check_alive(&self) -> io::Result<()> {
        if self.is_removed() {
            Err(from_errno(libc::ENODEV))
        } else {
            Ok(())
        }
    }

    /// Account for a new resource, failing with `ENOMEM` on exhaustion.
    pub(crate) fn acquire(&self, kind: ResourceKind) -> io::Result<()> {
        self.check_alive()?;
        let attr = &self.inner.attr;
        let mut usage = lock(&self.inner.usage);
        let (count, limit) = match kind {
            ResourceKind::Pd => (&mut usage.pds, attr.max_pd),
            ResourceKind::Cq => (&mut usage.cqs, attr.max_cq),
            ResourceKind::Qp => (&mut usage.qps, attr.max_qp),
            ResourceKind::Mr => (&mut usage.mrs, attr.max_mr),
        };
        if *count >= limit {
            return Err(from_errno(libc::ENOMEM));
        }
        *count += 1;
        Ok(())
    }

    /// Give back a resource accounted by [`Self::acquire`].
    pub(crate) fn release(&self, kind: ResourceKind) {
        let mut usage = lock(&self.inner.usage);
        let count = match kind {
            ResourceKind::Pd => &mut usage.pds,
            ResourceKind::Cq => &mut usage.cqs,
            ResourceKind::Qp => &mut usage.qps,
            ResourceKind::Mr => &mut usage.mrs,
        };
        *count = count.saturating_sub(1);
    }

    pub(crate) fn alloc_qpn(&self) -> Qpn {
        self.inner.next_qpn.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_pdn(&self) -> PdNum {
        self.inner.next_pdn.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a memory region into the device table.
    /// A remote key is generated only if the region grants remote access.
    pub(crate) fn insert_mr(&self, entry: MrEntry) -> (LKey, Option<RKey>) {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let lkey = key;
        // Bijective scramble, so rkeys never collide.
        let rkey = entry
            .perm
            .has_remote_access()
            .then(|| key.rotate_left(16) ^ 0x5a5a_5a5a);

        let mut table = write(&self.inner.mrs);
        table.by_lkey.insert(lkey, entry);
        if let Some(rkey) = rkey {
            table.by_rkey.insert(rkey, lkey);
        }
        (lkey, rkey)
    }

    /// Remove a memory region from the device table.
    ///
    /// Takes the table's write lock, so this waits for every in-flight
    /// data movement touching any region to finish.
    pub(crate) fn remove_mr(&self, lkey: LKey, rkey: Option<RKey>) {
        let mut table = write(&self.inner.mrs);
        table.by_lkey.remove(&lkey);
        if let Some(rkey) = rkey {
            table.by_rkey.remove(&rkey);
        }
    }

    /// Get a read guard of the memory region table.
    pub(crate) fn mr_table(&self) -> RwLockReadGuard<'_, MrTable> {
        read(&self.inner.mrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_enforced() {
        let ctx = Context::open_soft(
            "soft0",
            DeviceAttr {
                max_pd: 1,
                ..Default::default()
            },
        );
        ctx.acquire(ResourceKind::Pd).unwrap();
        let err = ctx.acquire(ResourceKind::Pd).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));

        ctx.release(ResourceKind::Pd);
        assert!(ctx.usage().is_empty());
    }

    #[test]
    fn removed_device_refuses_allocation() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        ctx.mark_removed();
        let err = ctx.acquire(ResourceKind::Cq).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }

    #[test]
    fn rkey_only_for_remote_access() {
        let ctx = Context::open_soft("soft0", DeviceAttr::default());
        let entry = MrEntry {
            addr: 0x1000,
            len: 64,
            perm: Permission::LOCAL_WRITE,
            pd: 1,
        };
        let (lkey, rkey) = ctx.insert_mr(entry);
        assert!(rkey.is_none());
        assert!(ctx.mr_table().local(lkey).is_some());

        let entry = MrEntry {
            perm: Permission::LOCAL_WRITE | Permission::REMOTE_READ,
            ..entry
        };
        let (lkey, rkey) = ctx.insert_mr(entry);
        let rkey = rkey.unwrap();
        assert_ne!(lkey, rkey);
        assert_eq!(ctx.mr_table().remote(rkey).unwrap().len, 64);

        ctx.remove_mr(lkey, Some(rkey));
        assert!(ctx.mr_table().remote(rkey).is_none());
    }

    #[test]
    fn entry_bounds() {
        let entry = MrEntry {
            addr: 100,
            len: 10,
            perm: Permission::LOCAL_WRITE,
            pd: 1,
        };
        assert!(entry.contains(100, 10));
        assert!(entry.contains(105, 5));
        assert!(!entry.contains(105, 6));
        assert!(!entry.contains(99, 1));
        assert!(entry.contains(110, 0));
    }
}

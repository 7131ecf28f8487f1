//! The network connection manager identities live on: either an in-process
//! software RC fabric, or the real RDMA devices of this host.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::{fmt, io};

use super::cm::{CmEventType, CmId, CmIdHandle, CmIdInner};
use super::context::{Context, DeviceAttr};
#[cfg(feature = "verbs")]
use super::verbs::{self, RawContext};
#[cfg(feature = "verbs")]
use crate::bindings::ibv_context;
use crate::utils::interop::from_errno;
use crate::utils::sync::lock;

enum Device {
    Soft(Context),
    /// Devices opened so far, by `ibv_context` address.
    #[cfg(feature = "verbs")]
    Verbs(Mutex<HashMap<usize, Context>>),
}

struct FabricInner {
    device: Device,
    listeners: Mutex<HashMap<SocketAddr, Weak<CmIdInner>>>,
    ids: Mutex<HashMap<CmIdHandle, Weak<CmIdInner>>>,
    next_handle: AtomicU64,
    next_port: AtomicU16,
}

/// The network connection manager identities live on.
///
/// A software fabric is an in-process network of one software RDMA device:
/// identities created on it can listen, connect and exchange RDMA traffic
/// with each other. A hardware fabric (`verbs` feature) hands identities to
/// librdmacm and reaches real peers. This type is a simple wrapper of an
/// `Arc`.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let device = match &self.inner.device {
            Device::Soft(ctx) => ctx.name().to_owned(),
            #[cfg(feature = "verbs")]
            Device::Verbs(_) => String::from("verbs"),
        };
        f.debug_struct("Fabric")
            .field("device", &device)
            .field("live_ids", &self.live_ids())
            .finish()
    }
}

impl Fabric {
    const EPHEMERAL_PORT_BASE: u16 = 49152;

    /// Create a fabric around a new software device.
    pub fn new(name: &str, attr: DeviceAttr) -> Self {
        Self::with_context(Context::open_soft(name, attr))
    }

    /// Create a fabric around an existing device.
    pub fn with_context(ctx: Context) -> Self {
        log::debug!("rwbench: fabric up on device {}", ctx.name());
        Self::build(Device::Soft(ctx))
    }

    /// Open the RDMA devices of this host. Fails with `ENODEV` if there is
    /// none.
    #[cfg(feature = "verbs")]
    pub fn verbs() -> io::Result<Self> {
        let n = verbs::count_devices()?;
        log::debug!("rwbench: fabric up on {} RDMA device(s)", n);
        Ok(Self::build(Device::Verbs(Mutex::new(HashMap::new()))))
    }

    fn build(device: Device) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                device,
                listeners: Mutex::new(HashMap::new()),
                ids: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                next_port: AtomicU16::new(Self::EPHEMERAL_PORT_BASE),
            }),
        }
    }

    /// Get the device of a software fabric. Hardware fabrics open devices
    /// per identity; see [`CmId::context`].
    #[inline]
    pub fn context(&self) -> Option<&Context> {
        match &self.inner.device {
            Device::Soft(ctx) => Some(ctx),
            #[cfg(feature = "verbs")]
            Device::Verbs(_) => None,
        }
    }

    /// Whether this is an in-process software fabric.
    #[inline]
    pub fn is_soft(&self) -> bool {
        matches!(self.inner.device, Device::Soft(_))
    }

    /// Fail with `ENODEV` if the software device has been removed.
    pub(crate) fn check_alive(&self) -> io::Result<()> {
        match self.context() {
            Some(ctx) => ctx.check_alive(),
            None => Ok(()),
        }
    }

    /// Get the context of a device librdmacm opened, wrapping it on first
    /// use.
    #[cfg(feature = "verbs")]
    pub(crate) fn open_device(&self, raw: *mut ibv_context) -> io::Result<Context> {
        let Device::Verbs(devices) = &self.inner.device else {
            return Err(from_errno(libc::EINVAL));
        };
        let mut devices = lock(devices);
        if let Some(ctx) = devices.get(&(raw as usize)) {
            return Ok(ctx.clone());
        }
        // SAFETY: `raw` comes from an identity bound to a device.
        let raw_ctx = unsafe { RawContext::new(raw) }.ok_or_else(|| from_errno(libc::ENODEV))?;
        let ctx = Context::open_verbs(raw_ctx)?;
        devices.insert(raw as usize, ctx.clone());
        Ok(ctx)
    }

    /// Number of live connection manager identities.
    pub fn live_ids(&self) -> usize {
        lock(&self.inner.ids)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Hot-unplug the software device. Every live identity receives a
    /// `DeviceRemoval` event; further verbs fail with `ENODEV`. Hardware
    /// fabrics are left alone.
    pub fn remove_device(&self) {
        let Some(ctx) = self.context() else {
            log::warn!("rwbench: cannot unplug a hardware device");
            return;
        };
        log::warn!("rwbench: removing device {}", ctx.name());
        ctx.mark_removed();
        let ids = lock(&self.inner.ids)
            .values()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>();
        for id in ids {
            CmId::from_inner(id).raise(CmEventType::DeviceRemoval, -libc::ENODEV);
        }
    }

    pub(crate) fn next_handle(&self) -> CmIdHandle {
        CmIdHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn ephemeral_port(&self) -> u16 {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        if port == u16::MAX {
            self.inner
                .next_port
                .store(Self::EPHEMERAL_PORT_BASE, Ordering::Relaxed);
        }
        port
    }

    pub(crate) fn register(&self, handle: CmIdHandle, id: Weak<CmIdInner>) {
        let mut ids = lock(&self.inner.ids);
        ids.retain(|_, w| w.strong_count() > 0);
        ids.insert(handle, id);
    }

    pub(crate) fn unregister(&self, handle: CmIdHandle) {
        lock(&self.inner.ids).remove(&handle);
    }

    /// Find a live identity by its handle.
    #[cfg(feature = "verbs")]
    pub(crate) fn lookup(&self, handle: CmIdHandle) -> Option<CmId> {
        lock(&self.inner.ids)
            .get(&handle)
            .and_then(Weak::upgrade)
            .map(CmId::from_inner)
    }

    /// Register a listener. Fails with `EADDRINUSE` if a live identity
    /// already listens on the address.
    pub(crate) fn add_listener(&self, addr: SocketAddr, id: Weak<CmIdInner>) -> io::Result<()> {
        let mut listeners = lock(&self.inner.listeners);
        if listeners.get(&addr).is_some_and(|w| w.strong_count() > 0) {
            return Err(from_errno(libc::EADDRINUSE));
        }
        listeners.insert(addr, id);
        Ok(())
    }

    /// Remove the listener registered by `id` on `addr`, if still present.
    pub(crate) fn remove_listener(&self, addr: SocketAddr, id: *const CmIdInner) {
        let mut listeners = lock(&self.inner.listeners);
        if listeners.get(&addr).is_some_and(|w| w.as_ptr() == id) {
            listeners.remove(&addr);
        }
    }

    /// Find the live listener serving `addr`, falling back to a wildcard
    /// listener on the same port.
    pub(crate) fn find_listener(&self, addr: SocketAddr) -> Option<CmId> {
        let listeners = lock(&self.inner.listeners);
        let wildcard = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        [addr, SocketAddr::new(wildcard, addr.port())]
            .iter()
            .find_map(|a| listeners.get(a).and_then(Weak::upgrade))
            .map(CmId::from_inner)
    }
}

use std::fmt;

use super::engine::ReapMode;
use super::error::BenchError;
use crate::rdma::cm::CmId;
use crate::rdma::cq::{CompChannel, Cq};
use crate::rdma::mr::Permission;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpBuilder, QpCaps};
use crate::wrap::{Backing, RegisteredMem};

/// Options of a [`ResourceSet`].
#[derive(Debug, Clone, Copy)]
pub struct ResourceOpts {
    /// Depth of both completion queues and both work queues.
    pub depth: u32,
    /// With [`ReapMode::Blocking`], the CQs get a completion channel and are
    /// armed on creation.
    pub reap_mode: ReapMode,
}

impl Default for ResourceOpts {
    fn default() -> Self {
        Self {
            depth: 1,
            reap_mode: ReapMode::Polling,
        }
    }
}

/// Index of a region registered in a [`ResourceSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(usize);

/// Transport resources of one connection.
///
/// Members are released in dependency order: queue pair, completion queues,
/// completion channel, regions (newest first), protection domain.
pub struct ResourceSet {
    cm_id: CmId,
    pd: Option<Pd>,
    channel: Option<CompChannel>,
    send_cq: Option<Cq>,
    recv_cq: Option<Cq>,
    qp: Option<Qp>,
    regions: Vec<RegisteredMem>,
}

impl fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSet")
            .field("cm_id", &self.cm_id.handle())
            .field("qp", &self.qp.as_ref().map(Qp::qp_num))
            .field("regions", &self.regions.len())
            .finish()
    }
}

impl ResourceSet {
    /// Allocate the resources of the connection of `cm_id` and attach the
    /// queue pair to it. Anything allocated before a failure is released.
    pub fn allocate(cm_id: &CmId, opts: &ResourceOpts) -> Result<Self, BenchError> {
        if opts.depth == 0 {
            return Err(BenchError::Config("queue depth must be at least 1".to_owned()));
        }
        let ctx = &cm_id.context()?;
        let mut set = ResourceSet {
            cm_id: cm_id.clone(),
            pd: None,
            channel: None,
            send_cq: None,
            recv_cq: None,
            qp: None,
            regions: Vec::new(),
        };

        let pd = Pd::new(ctx).map_err(|e| BenchError::exhausted("protection domain", e))?;
        set.pd = Some(pd.clone());

        if opts.reap_mode == ReapMode::Blocking {
            let channel =
                CompChannel::new(ctx).map_err(|e| BenchError::exhausted("completion channel", e))?;
            set.channel = Some(channel);
        }
        let make_cq = |what| {
            let cq = match &set.channel {
                Some(channel) => Cq::with_channel(ctx, opts.depth, channel),
                None => Cq::new(ctx, opts.depth),
            }
            .map_err(|e| BenchError::exhausted(what, e))?;
            if set.channel.is_some() {
                cq.req_notify().map_err(|e| BenchError::exhausted(what, e))?;
            }
            Ok::<_, BenchError>(cq)
        };
        let send_cq = make_cq("send completion queue")?;
        set.send_cq = Some(send_cq.clone());
        let recv_cq = make_cq("receive completion queue")?;
        set.recv_cq = Some(recv_cq.clone());

        let builder = QpBuilder::new()
            .send_cq(&send_cq)
            .recv_cq(&recv_cq)
            .caps(QpCaps::with_depth(opts.depth))
            .sq_sig_all(true);
        let qp = cm_id
            .create_qp(&pd, builder)
            .map_err(|e| BenchError::exhausted("queue pair", e))?;
        set.qp = Some(qp);

        log::debug!(
            "rwbench: {} resources allocated (depth {}, {:?})",
            cm_id.handle(),
            opts.depth,
            opts.reap_mode
        );
        Ok(set)
    }

    /// Register a buffer with the protection domain of this set.
    pub fn register(&mut self, backing: Backing, perm: Permission) -> Result<RegionId, BenchError> {
        let pd = self.pd.as_ref().ok_or_else(|| {
            BenchError::exhausted("memory region", "resource set already released")
        })?;
        let mem = RegisteredMem::new(pd, backing, perm)?;
        self.regions.push(mem);
        Ok(RegionId(self.regions.len() - 1))
    }

    /// Get a registered region.
    #[inline]
    pub fn region(&self, id: RegionId) -> Option<&RegisteredMem> {
        self.regions.get(id.0)
    }

    #[inline]
    pub fn cm_id(&self) -> &CmId {
        &self.cm_id
    }

    #[inline]
    pub fn pd(&self) -> Option<&Pd> {
        self.pd.as_ref()
    }

    #[inline]
    pub fn qp(&self) -> Option<&Qp> {
        self.qp.as_ref()
    }

    #[inline]
    pub fn send_cq(&self) -> Option<&Cq> {
        self.send_cq.as_ref()
    }

    #[inline]
    pub fn recv_cq(&self) -> Option<&Cq> {
        self.recv_cq.as_ref()
    }

    /// Whether every member has been released.
    pub fn is_released(&self) -> bool {
        self.pd.is_none()
            && self.channel.is_none()
            && self.send_cq.is_none()
            && self.recv_cq.is_none()
            && self.qp.is_none()
            && self.regions.is_empty()
    }

    /// Release every member that is still held. Idempotent.
    pub fn release(&mut self) {
        if self.is_released() {
            return;
        }
        if self.qp.take().is_some() {
            self.cm_id.destroy_qp();
        }
        drop(self.send_cq.take());
        drop(self.recv_cq.take());
        drop(self.channel.take());
        while let Some(mem) = self.regions.pop() {
            drop(mem);
        }
        drop(self.pd.take());
        log::trace!("rwbench: {} resources released", self.cm_id.handle());
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::cm::{EventChannel, PortSpace};
    use crate::rdma::context::DeviceAttr;
    use crate::rdma::fabric::Fabric;
    use crate::rdma::qp::QpState;

    fn id(fabric: &Fabric, channel: &EventChannel) -> CmId {
        CmId::new(fabric, channel, PortSpace::Tcp).unwrap()
    }

    #[test]
    fn allocate_and_release() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let cm_id = id(&fabric, &channel);

        let mut set = ResourceSet::allocate(&cm_id, &ResourceOpts::default()).unwrap();
        let meta = set.register(Backing::Heap { len: 16 }, Permission::LOCAL_WRITE).unwrap();
        let data = set.register(Backing::Heap { len: 100 }, Permission::default()).unwrap();
        assert!(set.region(meta).unwrap().as_remote().is_none());
        assert_eq!(set.region(data).unwrap().len(), 100);

        let qp = set.qp().unwrap();
        assert_eq!(qp.state(), QpState::Init);
        assert_eq!(qp.caps().max_send_wr, 1);
        assert_eq!(cm_id.qp().as_ref(), Some(qp));

        let usage = fabric.context().unwrap().usage();
        assert_eq!((usage.pds, usage.cqs, usage.qps, usage.mrs), (1, 2, 1, 2));

        set.release();
        assert!(set.is_released());
        assert!(cm_id.qp().is_none());
        assert!(fabric.context().unwrap().usage().is_empty());
        set.release();
        assert!(set.register(Backing::Heap { len: 8 }, Permission::default()).is_err());
    }

    #[test]
    fn advertised_length_matches_the_region() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let cm_id = id(&fabric, &channel);
        let mut set = ResourceSet::allocate(&cm_id, &ResourceOpts::default()).unwrap();

        for len in [1, 2, 15, 16, 17, 63, 64, 100, 4096, 65_537, 1 << 24] {
            let region = set.register(Backing::Heap { len }, Permission::default()).unwrap();
            let region = set.region(region).unwrap();
            let remote = region.as_remote().unwrap();
            assert_eq!(remote.len, len);
            assert_eq!(remote.addr, region.addr() as u64);
            assert_eq!(crate::ctrl::decode(&crate::ctrl::encode(&remote)).unwrap(), remote);
        }
        assert_eq!(fabric.context().unwrap().usage().mrs, 11);
    }

    #[test]
    fn blocking_mode_arms_both_queues() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let cm_id = id(&fabric, &channel);
        let opts = ResourceOpts {
            depth: 4,
            reap_mode: ReapMode::Blocking,
        };
        let set = ResourceSet::allocate(&cm_id, &opts).unwrap();
        assert!(set.send_cq().unwrap().channel().is_some());
        assert!(set.recv_cq().unwrap().channel().is_some());
        drop(set);
        assert!(fabric.context().unwrap().usage().is_empty());
    }

    #[test]
    fn zero_depth_is_rejected() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let opts = ResourceOpts {
            depth: 0,
            ..Default::default()
        };
        assert!(ResourceSet::allocate(&id(&fabric, &channel), &opts).is_err());
        assert!(fabric.context().unwrap().usage().is_empty());
    }

    #[test]
    fn partial_allocation_is_rolled_back() {
        let fabric = Fabric::new(
            "soft0",
            DeviceAttr {
                max_qp: 0,
                ..Default::default()
            },
        );
        let channel = EventChannel::new();
        let err = ResourceSet::allocate(&id(&fabric, &channel), &ResourceOpts::default());
        assert!(matches!(
            err,
            Err(BenchError::ResourceExhausted { what: "queue pair", .. })
        ));
        assert!(fabric.context().unwrap().usage().is_empty());
    }

    #[test]
    fn failed_registration_keeps_the_rest() {
        let fabric = Fabric::new(
            "soft0",
            DeviceAttr {
                max_mr: 1,
                ..Default::default()
            },
        );
        let channel = EventChannel::new();
        let mut set = ResourceSet::allocate(&id(&fabric, &channel), &ResourceOpts::default()).unwrap();
        set.register(Backing::Heap { len: 16 }, Permission::LOCAL_WRITE).unwrap();
        assert!(matches!(
            set.register(Backing::Heap { len: 16 }, Permission::default()),
            Err(BenchError::RegistrationFailed(_))
        ));
        assert_eq!(fabric.context().unwrap().usage().mrs, 1);
        set.release();
        assert!(fabric.context().unwrap().usage().is_empty());
    }
}

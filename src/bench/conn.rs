use std::collections::HashMap;

use super::resources::{RegionId, ResourceSet};
use crate::ctrl::{ConnEvent, ConnState, Role};
use crate::rdma::cm::{CmId, CmIdHandle};
use crate::rdma::mr::MrRemote;
use crate::rdma::qp::Qp;
use crate::wrap::RegisteredMem;

/// Regions registered for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnRegions {
    /// Staging buffer of the descriptor exchange.
    pub meta: RegionId,
    /// Acceptor: the advertised target region. Initiator: the write source.
    pub data: RegionId,
    /// Initiator only: the read destination.
    pub sink: Option<RegionId>,
}

/// One benchmark connection.
#[derive(Debug)]
pub struct Connection {
    // Resources are declared first so they are released before the identity.
    resources: Option<ResourceSet>,
    regions: Option<ConnRegions>,
    remote: Option<MrRemote>,
    index: usize,
    role: Role,
    state: ConnState,
    id: CmId,
}

impl Connection {
    fn new(index: usize, id: CmId, role: Role) -> Self {
        Self {
            resources: None,
            regions: None,
            remote: None,
            index,
            role,
            state: ConnState::Idle,
            id,
        }
    }

    /// Position of this connection in its arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn id(&self) -> &CmId {
        &self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    /// Apply a connection manager event. Return the new state, or `None` if
    /// the event is not expected in the current state.
    pub fn on_event(&mut self, event: &ConnEvent) -> Option<ConnState> {
        let next = self.state.on_event(self.role, event)?;
        log::trace!(
            "rwbench: connection {} {} -> {}",
            self.index,
            self.state,
            next
        );
        self.state = next;
        Some(next)
    }

    /// Local action: start address resolution.
    pub fn start_resolving(&mut self) -> bool {
        self.transit(ConnState::start_resolving)
    }

    /// Local action: start disconnecting.
    pub fn start_disconnect(&mut self) -> bool {
        self.transit(ConnState::start_disconnect)
    }

    fn transit(&mut self, action: fn(ConnState) -> Option<ConnState>) -> bool {
        match action(self.state) {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        }
    }

    /// Mark the connection failed and release its resources. Return the
    /// state it failed from.
    pub fn fail(&mut self) -> ConnState {
        let prev = std::mem::replace(&mut self.state, ConnState::Failed);
        self.release();
        prev
    }

    /// Attach the resources allocated for this connection.
    pub fn attach(&mut self, resources: ResourceSet, regions: ConnRegions) {
        self.resources = Some(resources);
        self.regions = Some(regions);
    }

    /// Release the resources of this connection, keeping its identity. The
    /// peer's descriptor goes with them.
    pub fn release(&mut self) {
        self.remote = None;
        self.regions = None;
        if let Some(mut resources) = self.resources.take() {
            resources.release();
        }
    }

    #[inline]
    pub fn resources(&self) -> Option<&ResourceSet> {
        self.resources.as_ref()
    }

    #[inline]
    pub fn qp(&self) -> Option<&Qp> {
        self.resources.as_ref()?.qp()
    }

    fn region(&self, pick: impl FnOnce(&ConnRegions) -> Option<RegionId>) -> Option<&RegisteredMem> {
        let id = pick(self.regions.as_ref()?)?;
        self.resources.as_ref()?.region(id)
    }

    /// The descriptor staging buffer.
    pub fn meta(&self) -> Option<&RegisteredMem> {
        self.region(|r| Some(r.meta))
    }

    /// The advertised region (acceptor) or the write source (initiator).
    pub fn data(&self) -> Option<&RegisteredMem> {
        self.region(|r| Some(r.data))
    }

    /// The read destination (initiator).
    pub fn sink(&self) -> Option<&RegisteredMem> {
        self.region(|r| r.sink)
    }

    /// The peer's descriptor, once exchanged.
    #[inline]
    pub fn remote(&self) -> Option<MrRemote> {
        self.remote
    }

    pub(crate) fn set_remote(&mut self, remote: MrRemote) {
        self.remote = Some(remote);
    }
}

/// Connections of an endpoint, indexed by position and by identity.
#[derive(Debug, Default)]
pub struct ConnArena {
    conns: Vec<Connection>,
    by_handle: HashMap<CmIdHandle, usize>,
}

impl ConnArena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            conns: Vec::with_capacity(capacity),
            by_handle: HashMap::with_capacity(capacity),
        }
    }

    /// Add a connection for `id` and return its index.
    pub fn insert(&mut self, id: CmId, role: Role) -> usize {
        let index = self.conns.len();
        self.by_handle.insert(id.handle(), index);
        self.conns.push(Connection::new(index, id, role));
        index
    }

    /// Find the connection of an identity.
    #[inline]
    pub fn lookup(&self, handle: CmIdHandle) -> Option<usize> {
        self.by_handle.get(&handle).copied()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Connection> {
        self.conns.get(index)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.conns.get_mut(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.iter_mut()
    }

    /// Connections currently established.
    pub fn established(&self) -> impl Iterator<Item = &Connection> {
        self.conns.iter().filter(|c| c.is_established())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::cm::{EventChannel, PortSpace};
    use crate::rdma::context::DeviceAttr;
    use crate::rdma::fabric::Fabric;

    #[test]
    fn lookup_by_handle() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let mut arena = ConnArena::with_capacity(2);
        let a = CmId::new(&fabric, &channel, PortSpace::Tcp).unwrap();
        let b = CmId::new(&fabric, &channel, PortSpace::Tcp).unwrap();
        let (ha, hb) = (a.handle(), b.handle());
        assert_eq!(arena.insert(a, Role::Initiator), 0);
        assert_eq!(arena.insert(b, Role::Initiator), 1);
        assert_eq!(arena.lookup(hb), Some(1));
        assert_eq!(arena.get(arena.lookup(ha).unwrap()).unwrap().index(), 0);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.established().count(), 0);
    }

    #[test]
    fn local_actions_and_failure() {
        let fabric = Fabric::new("soft0", DeviceAttr::default());
        let channel = EventChannel::new();
        let mut arena = ConnArena::default();
        let idx = arena.insert(
            CmId::new(&fabric, &channel, PortSpace::Tcp).unwrap(),
            Role::Initiator,
        );
        let conn = arena.get_mut(idx).unwrap();
        assert!(!conn.start_disconnect());
        assert!(conn.start_resolving());
        assert_eq!(conn.on_event(&ConnEvent::AddrResolved), Some(ConnState::RouteResolving));
        assert_eq!(conn.on_event(&ConnEvent::Established), None);
        conn.set_remote(MrRemote::new(0x1000, 64, 7));
        assert!(conn.remote().is_some());
        assert_eq!(conn.fail(), ConnState::RouteResolving);
        assert!(conn.remote().is_none());
        assert_eq!(conn.on_event(&ConnEvent::Disconnected), None);
        assert!(conn.meta().is_none());
    }
}

use std::fmt;

use crate::rdma::cm::CmEventType;

/// Which side of a connection an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Resolves and connects (client).
    Initiator,
    /// Listens and accepts (server).
    Acceptor,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Idle,
    AddressResolving,
    RouteResolving,
    Connecting,
    Accepting,
    Established,
    Disconnecting,
    Closed,
    Failed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection manager event as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    AddrResolved,
    AddrError { status: i32 },
    RouteResolved,
    RouteError { status: i32 },
    ConnectRequest,
    ConnectError { status: i32 },
    Unreachable { status: i32 },
    Rejected { status: i32 },
    Established,
    Disconnected,
    DeviceRemoval { status: i32 },
    /// A normally successful event that arrived with a non-zero status.
    Faulted { event: CmEventType, status: i32 },
}

impl ConnEvent {
    /// Convert a raw connection manager event.
    pub fn from_cm(kind: CmEventType, status: i32) -> Self {
        if status != 0 && !kind.is_error() {
            return ConnEvent::Faulted {
                event: kind,
                status,
            };
        }
        match kind {
            CmEventType::AddrResolved => ConnEvent::AddrResolved,
            CmEventType::AddrError => ConnEvent::AddrError { status },
            CmEventType::RouteResolved => ConnEvent::RouteResolved,
            CmEventType::RouteError => ConnEvent::RouteError { status },
            CmEventType::ConnectRequest => ConnEvent::ConnectRequest,
            CmEventType::ConnectError => ConnEvent::ConnectError { status },
            CmEventType::Unreachable => ConnEvent::Unreachable { status },
            CmEventType::Rejected => ConnEvent::Rejected { status },
            CmEventType::Established => ConnEvent::Established,
            CmEventType::Disconnected => ConnEvent::Disconnected,
            CmEventType::DeviceRemoval => ConnEvent::DeviceRemoval { status },
        }
    }

    /// Whether this event fails the connection it concerns.
    pub fn is_error(&self) -> bool {
        self.status().is_some()
    }

    /// Status carried by an error event.
    pub fn status(&self) -> Option<i32> {
        match *self {
            ConnEvent::AddrError { status }
            | ConnEvent::RouteError { status }
            | ConnEvent::ConnectError { status }
            | ConnEvent::Unreachable { status }
            | ConnEvent::Rejected { status }
            | ConnEvent::DeviceRemoval { status }
            | ConnEvent::Faulted { status, .. } => Some(status),
            _ => None,
        }
    }
}

impl ConnState {
    /// Whether no further transition is possible.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Failed)
    }

    /// The transition table. Return the next state, or `None` if the event
    /// is not expected in this state for this role.
    pub fn on_event(self, role: Role, event: &ConnEvent) -> Option<ConnState> {
        use ConnState::*;

        if self.is_terminal() {
            return None;
        }
        if event.is_error() {
            return Some(Failed);
        }
        match (role, self, event) {
            (Role::Initiator, AddressResolving, ConnEvent::AddrResolved) => Some(RouteResolving),
            (Role::Initiator, RouteResolving, ConnEvent::RouteResolved) => Some(Connecting),
            (Role::Initiator, Connecting, ConnEvent::Established) => Some(Established),
            (Role::Acceptor, Idle, ConnEvent::ConnectRequest) => Some(Accepting),
            (Role::Acceptor, Accepting, ConnEvent::Established) => Some(Established),
            (_, Established | Disconnecting, ConnEvent::Disconnected) => Some(Closed),
            _ => None,
        }
    }

    /// Local action: start address resolution.
    pub fn start_resolving(self) -> Option<ConnState> {
        (self == ConnState::Idle).then_some(ConnState::AddressResolving)
    }

    /// Local action: start disconnecting.
    pub fn start_disconnect(self) -> Option<ConnState> {
        (self == ConnState::Established).then_some(ConnState::Disconnecting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_happy_path() {
        let role = Role::Initiator;
        let s = ConnState::Idle.start_resolving().unwrap();
        let s = s.on_event(role, &ConnEvent::AddrResolved).unwrap();
        assert_eq!(s, ConnState::RouteResolving);
        let s = s.on_event(role, &ConnEvent::RouteResolved).unwrap();
        assert_eq!(s, ConnState::Connecting);
        let s = s.on_event(role, &ConnEvent::Established).unwrap();
        let s = s.start_disconnect().unwrap();
        assert_eq!(s.on_event(role, &ConnEvent::Disconnected), Some(ConnState::Closed));
    }

    #[test]
    fn acceptor_happy_path() {
        let role = Role::Acceptor;
        let s = ConnState::Idle.on_event(role, &ConnEvent::ConnectRequest).unwrap();
        assert_eq!(s, ConnState::Accepting);
        let s = s.on_event(role, &ConnEvent::Established).unwrap();
        assert_eq!(s.on_event(role, &ConnEvent::Disconnected), Some(ConnState::Closed));
    }

    #[test]
    fn errors_fail_from_any_live_state() {
        let errors = [
            ConnEvent::AddrError { status: -1 },
            ConnEvent::RouteError { status: -1 },
            ConnEvent::ConnectError { status: -1 },
            ConnEvent::Unreachable { status: -111 },
            ConnEvent::Rejected { status: 28 },
            ConnEvent::DeviceRemoval { status: -19 },
        ];
        for state in [
            ConnState::AddressResolving,
            ConnState::Connecting,
            ConnState::Established,
        ] {
            for ev in &errors {
                assert_eq!(state.on_event(Role::Initiator, ev), Some(ConnState::Failed));
            }
        }
        assert_eq!(
            ConnState::Closed.on_event(Role::Initiator, &errors[0]),
            None
        );
    }

    #[test]
    fn nonzero_status_fails_a_success_event() {
        let ev = ConnEvent::from_cm(CmEventType::Established, -110);
        assert_eq!(
            ev,
            ConnEvent::Faulted {
                event: CmEventType::Established,
                status: -110,
            }
        );
        assert_eq!(ev.status(), Some(-110));
        assert_eq!(
            ConnState::Connecting.on_event(Role::Initiator, &ev),
            Some(ConnState::Failed)
        );
        assert_eq!(
            ConnState::Accepting.on_event(Role::Acceptor, &ev),
            Some(ConnState::Failed)
        );

        let ev = ConnEvent::from_cm(CmEventType::AddrResolved, -19);
        assert_eq!(
            ConnState::AddressResolving.on_event(Role::Initiator, &ev),
            Some(ConnState::Failed)
        );
        assert_eq!(
            ConnEvent::from_cm(CmEventType::Established, 0),
            ConnEvent::Established
        );
        assert_eq!(
            ConnEvent::from_cm(CmEventType::Rejected, 28),
            ConnEvent::Rejected { status: 28 }
        );
    }

    #[test]
    fn unexpected_events_are_refused() {
        assert_eq!(
            ConnState::Idle.on_event(Role::Initiator, &ConnEvent::ConnectRequest),
            None
        );
        assert_eq!(
            ConnState::Connecting.on_event(Role::Acceptor, &ConnEvent::Established),
            None
        );
        assert_eq!(ConnState::Connecting.start_disconnect(), None);
        assert_eq!(ConnState::Failed.start_resolving(), None);
    }
}

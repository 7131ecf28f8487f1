use std::fmt;

/// Queue pair state.
///
/// Discriminants follow `ibv_qp_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum QpState {
    /// Reset.
    #[default]
    Reset = 0,

    /// Initialized. Receives may be posted.
    Init = 1,

    /// Ready To Receive.
    Rtr = 2,

    /// Ready To Send.
    Rts = 3,

    /// Send Queue Drained.
    Sqd = 4,

    /// Send Queue Error.
    Sqe = 5,

    /// Error. Outstanding and new work requests are flushed.
    Error = 6,
}

impl QpState {
    /// Convert a numeric `ibv_qp_state` value. Unknown values map to
    /// [`QpState::Error`].
    pub fn from_raw(state: u32) -> Self {
        match state {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::Rtr,
            3 => QpState::Rts,
            4 => QpState::Sqd,
            5 => QpState::Sqe,
            _ => QpState::Error,
        }
    }

    /// Whether receive requests may be posted in this state.
    #[inline]
    pub fn can_post_recv(self) -> bool {
        self != QpState::Reset
    }

    /// Whether send requests may be posted in this state.
    #[inline]
    pub fn can_post_send(self) -> bool {
        matches!(self, QpState::Rts | QpState::Error)
    }
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
            QpState::Sqd => "SQD",
            QpState::Sqe => "SQE",
            QpState::Error => "ERR",
        };
        f.write_str(s)
    }
}

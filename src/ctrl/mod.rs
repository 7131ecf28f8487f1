mod barrier;
mod connecter;
mod state;

pub use barrier::Barrier;
pub use connecter::{decode, encode, Connecter, ExchangeError, DESCRIPTOR_LEN, DESCRIPTOR_WR_ID};
pub use state::{ConnEvent, ConnState, Role};

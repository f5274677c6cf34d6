//! Recording coordinator
//!
//! Distributed control plane for a session: the host drives
//! countdown/start/stop over the peer channel, and every peer (the host
//! included) reacts by starting and stopping its local capture. One
//! coordinator task per peer per session.

pub mod session;
pub mod state;

pub use session::{CoordinatorHandle, SessionCoordinator, SessionOptions, StopOutcome};
pub use state::{
    CoordinatorConfig, CoordinatorError, CoordinatorEvent, PeerStatus, Phase, SessionClockOffset,
    SessionSnapshot,
};

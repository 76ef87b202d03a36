pub mod pairings;
pub mod shutdown;

pub use pairings::{PairingInfo, PairingMode, PairingTracker};
pub use shutdown::{GracefulShutdown, ShutdownReason};

//! Connection lifecycle supervision
//!
//! Owns the single long-lived socket to the endpoint:
//! - Connect / disconnect with a fixed-delay reconnect on failure
//! - A receive loop publishing inbound text frames
//! - A periodic liveness ping
//! - Suspension while the network path is unreachable

mod reachability;
mod state;
mod supervisor;
mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use reachability::*;
pub use state::*;
pub use supervisor::*;
pub use transport::*;

//! Outbound delivery
//!
//! Sends go straight to the connection when it is up. Anything that cannot
//! be sent lands in a durable FIFO retry queue that is flushed each time a
//! connection is established.

mod coordinator;
mod message;
mod queue;

pub use coordinator::*;
pub use message::*;
pub use queue::*;

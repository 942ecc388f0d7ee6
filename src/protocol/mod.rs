//! Wire protocol for the chat socket
//!
//! Outbound frames carry a JSON envelope so the delivery layer's retry
//! identity survives the trip. Inbound frames that are not envelopes are
//! accepted as plain text and routed to the default conversation.

mod envelope;

pub use envelope::*;

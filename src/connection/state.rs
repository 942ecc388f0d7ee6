//! Connection state machine values

use std::fmt;

/// Lifecycle state of the supervised socket
///
/// Exactly one value holds at any time; only the supervisor's actor task
/// changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket; a reconnect may be pending
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake complete, frames may flow
    Connected,
    /// Network path unreachable; no connect or reconnect is attempted
    OfflineSuspended,
}

impl ConnectionState {
    /// Whether frames can be transmitted
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }

    /// States that warrant the connectivity badge once they persist
    pub fn is_down(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::OfflineSuspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::OfflineSuspended => "offline-suspended",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

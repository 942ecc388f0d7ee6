//! Error types for the chatlink client
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Retry classification for the connection and delivery core
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,
    QueueStore = 210,

    // Connection errors (3xx)
    ConnectFailed = 300,
    ConnectTimeout = 301,
    TransmitFailed = 302,
    NotConnected = 303,
    Unreachable = 304,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,

    // Internal errors (9xx)
    ChannelClosed = 901,
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Retry queue persistence failed
    #[error("Retry queue store {path} failed: {message}")]
    QueueStore { path: PathBuf, message: String },

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Handshake or transport error while connecting
    #[error("Failed to connect to {url}: {message}")]
    ConnectFailed { url: String, message: String },

    /// Handshake did not complete in time
    #[error("Connection to {url} timed out after {timeout_secs}s")]
    ConnectTimeout { url: String, timeout_secs: u64 },

    /// Transport rejected a frame while connected
    #[error("Transmit failed: {message}")]
    TransmitFailed { message: String },

    /// Send attempted while the socket is not connected
    #[error("Not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    /// Network path reported unreachable
    #[error("Network unreachable")]
    Unreachable,

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// An internal task channel is gone (component shut down)
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::QueueStore { .. } => ErrorCode::QueueStore,
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::WebSocket(_) => ErrorCode::TransmitFailed,

            Error::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            Error::ConnectTimeout { .. } => ErrorCode::ConnectTimeout,
            Error::TransmitFailed { .. } => ErrorCode::TransmitFailed,
            Error::NotConnected { .. } => ErrorCode::NotConnected,
            Error::Unreachable => ErrorCode::Unreachable,

            Error::ChannelClosed(_) => ErrorCode::ChannelClosed,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is recovered by reconnecting and retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed { .. }
                | Error::ConnectTimeout { .. }
                | Error::TransmitFailed { .. }
                | Error::NotConnected { .. }
                | Error::Unreachable
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (process should exit)
    ///
    /// Only startup configuration problems qualify; the connection and
    /// delivery core always recovers given eventual connectivity.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'chatlink config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'chatlink config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::ConnectFailed { .. } => Some(
                "Check your network connection and verify the endpoint URL. Reconnects happen automatically."
            ),
            Error::ConnectTimeout { .. } => Some(
                "The endpoint may be down or unreachable. Check your firewall settings."
            ),
            Error::NotConnected { .. } | Error::TransmitFailed { .. } => Some(
                "The message was queued and will be sent when the connection is restored."
            ),
            Error::Unreachable => Some(
                "No network path is available. The client resumes once the network returns."
            ),
            Error::QueueStore { .. } => Some(
                "Check permissions on the queue file directory, or point 'delivery.queue_file' elsewhere."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connect failed error
    pub fn connect_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a transmit failed error
    pub fn transmit_failed(message: impl Into<String>) -> Self {
        Error::TransmitFailed {
            message: message.into(),
        }
    }

    /// Create a queue store error
    pub fn queue_store(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::QueueStore {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::ConnectFailed.as_str(), "E300");
        assert_eq!(ErrorCode::NotConnected.as_str(), "E303");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigValidation.exit_code(), 10);
        assert_eq!(ErrorCode::QueueStore.exit_code(), 20);
        assert_eq!(ErrorCode::Unreachable.exit_code(), 30);
        assert_eq!(ErrorCode::ProtocolMalformed.exit_code(), 40);
        assert_eq!(ErrorCode::ChannelClosed.exit_code(), 90);
    }

    #[test]
    fn test_core_taxonomy_is_retryable_and_never_fatal() {
        let core = [
            Error::connect_failed("ws://x", "refused"),
            Error::ConnectTimeout { url: "ws://x".into(), timeout_secs: 10 },
            Error::transmit_failed("broken pipe"),
            Error::NotConnected { state: ConnectionState::Disconnected },
            Error::Unreachable,
        ];
        for err in &core {
            assert!(err.is_retryable(), "{} should be retryable", err);
            assert!(!err.is_fatal(), "{} should not be fatal", err);
        }
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(Error::config_not_found("/x").is_fatal());
        assert!(Error::config_field_invalid("connection.url", "empty").is_fatal());
        assert!(!Error::config_not_found("/x").is_retryable());
    }

    #[test]
    fn test_not_connected_display_includes_state() {
        let err = Error::NotConnected { state: ConnectionState::OfflineSuspended };
        assert!(err.to_string().contains("offline"));
        assert_eq!(err.code(), ErrorCode::NotConnected);
    }

    #[test]
    fn test_suggestions() {
        let err = Error::config_not_found("/test");
        assert!(err.suggestion().unwrap().contains("config init"));

        let err = Error::transmit_failed("reset");
        assert!(err.suggestion().unwrap().contains("queued"));

        assert!(Error::Internal("x".into()).suggestion().is_none());
    }

    #[test]
    fn test_format_for_terminal_and_log() {
        let err = Error::config_not_found("/test/client.toml");

        let terminal = err.format_for_terminal();
        assert!(terminal.contains("E100"));
        assert!(terminal.contains("\x1b[31m"));
        assert!(terminal.contains("Hint"));

        let log = err.format_for_log();
        assert!(log.contains("[E100]"));
        assert!(!log.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}

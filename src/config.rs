//! Configuration system for the chatlink client
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (CHATLINK_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identity
    pub client: ClientSettings,

    /// Socket connection settings
    pub connection: ConnectionSettings,

    /// Reachability probing
    pub network: NetworkSettings,

    /// Outbound delivery and retry queue
    pub delivery: DeliverySettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Client identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Sender label stamped on outgoing envelopes (defaults to hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Conversation that receives plain-text inbound frames
    pub default_chat_id: String,
}

/// Socket connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Endpoint WebSocket URL
    pub url: String,

    /// Fixed delay before a reconnect attempt, in milliseconds
    pub reconnect_delay_ms: u64,

    /// Liveness ping interval in milliseconds
    pub ping_interval_ms: u64,

    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Capacity of the upward event channels
    pub event_buffer: usize,
}

/// Reachability probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Probe the endpoint host to drive automatic connect/disconnect
    pub probe_enabled: bool,

    /// Interval between probes in milliseconds
    pub probe_interval_ms: u64,

    /// Per-probe TCP connect timeout in milliseconds
    pub probe_timeout_ms: u64,
}

/// Delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// File backing the durable retry queue
    pub queue_file: String,

    /// Maximum queued messages (0 = unbounded, otherwise oldest is evicted)
    pub max_queue_len: usize,

    /// How long the link must stay down before the connectivity badge shows
    pub badge_delay_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            name: None,
            default_chat_id: "default_chat".to_string(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "wss://echo.websocket.org".to_string(),
            reconnect_delay_ms: 3000,
            ping_interval_ms: 20000,
            connect_timeout_ms: 10000,
            event_buffer: 256,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_enabled: true,
            probe_interval_ms: 5000,
            probe_timeout_ms: 2000,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            queue_file: "~/.chatlink/outbox.json".to_string(),
            max_queue_len: 0,
            badge_delay_ms: 1500,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 50,
            max_files: 5,
            json_format: false,
        }
    }
}

impl ConnectionSettings {
    /// Reconnect delay as a Duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Ping interval as a Duration
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Handshake timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClientConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: e.to_string(),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("chatlink.toml"),
            dirs::config_dir()
                .map(|p| p.join("chatlink").join("client.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".chatlink").join("client.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/chatlink/client.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CHATLINK_NAME") {
            self.client.name = Some(val);
        }
        if let Ok(val) = std::env::var("CHATLINK_DEFAULT_CHAT") {
            self.client.default_chat_id = val;
        }

        if let Ok(val) = std::env::var("CHATLINK_URL") {
            self.connection.url = val;
        }
        env_parse("CHATLINK_RECONNECT_DELAY_MS", &mut self.connection.reconnect_delay_ms);
        env_parse("CHATLINK_PING_INTERVAL_MS", &mut self.connection.ping_interval_ms);
        env_parse("CHATLINK_CONNECT_TIMEOUT_MS", &mut self.connection.connect_timeout_ms);

        if let Ok(val) = std::env::var("CHATLINK_PROBE_ENABLED") {
            self.network.probe_enabled = parse_bool(&val);
        }
        env_parse("CHATLINK_PROBE_INTERVAL_MS", &mut self.network.probe_interval_ms);

        if let Ok(val) = std::env::var("CHATLINK_QUEUE_FILE") {
            self.delivery.queue_file = val;
        }
        env_parse("CHATLINK_MAX_QUEUE_LEN", &mut self.delivery.max_queue_len);

        if let Ok(val) = std::env::var("CHATLINK_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("CHATLINK_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("CHATLINK_LOG_JSON") {
            self.logging.json_format = parse_bool(&val);
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.delivery.queue_file = expand_path(&self.delivery.queue_file);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = &self.connection.url;
        if url.is_empty() {
            return Err(Error::config_field_invalid("connection.url", "URL cannot be empty"));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "connection.url",
                "URL must start with ws:// or wss://",
            ));
        }
        Url::parse(url).map_err(|e| {
            Error::config_field_invalid("connection.url", format!("Invalid URL: {}", e))
        })?;

        if self.connection.reconnect_delay_ms == 0 {
            return Err(Error::config_field_invalid(
                "connection.reconnect_delay_ms",
                "reconnect delay must be greater than zero",
            ));
        }
        if self.connection.ping_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "connection.ping_interval_ms",
                "ping interval must be greater than zero",
            ));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "connection.connect_timeout_ms",
                "connect timeout must be greater than zero",
            ));
        }
        if self.network.probe_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "network.probe_interval_ms",
                "probe interval must be greater than zero",
            ));
        }
        if self.network.probe_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "network.probe_timeout_ms",
                "probe timeout must be greater than zero",
            ));
        }
        if self.connection.event_buffer == 0 {
            return Err(Error::config_field_invalid(
                "connection.event_buffer",
                "event buffer must be greater than zero",
            ));
        }
        if self.client.default_chat_id.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "client.default_chat_id",
                "default chat id cannot be empty",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Sender label, falling back to the machine hostname
    pub fn client_name(&self) -> String {
        self.client.name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "chatlink".to_string())
        })
    }

    /// Retry queue file as a PathBuf
    pub fn queue_file(&self) -> PathBuf {
        PathBuf::from(&self.delivery.queue_file)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file, returning where it was written
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".chatlink")
                .join("client.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# chatlink client configuration

[client]
# Sender label stamped on outgoing messages (defaults to hostname)
# name = "my-laptop"

# Conversation that receives plain-text inbound frames
default_chat_id = "default_chat"

[connection]
# Endpoint WebSocket URL
url = "wss://echo.websocket.org"

# Fixed delay before each reconnect attempt (milliseconds, not exponential)
reconnect_delay_ms = 3000

# Liveness ping interval (milliseconds)
ping_interval_ms = 20000

# Handshake timeout (milliseconds)
connect_timeout_ms = 10000

# Capacity of the event channels
event_buffer = 256

[network]
# Probe the endpoint host to detect connectivity loss
probe_enabled = true

# Interval between probes (milliseconds)
probe_interval_ms = 5000

# Per-probe connect timeout (milliseconds)
probe_timeout_ms = 2000

[delivery]
# Durable retry queue for messages sent while offline
queue_file = "~/.chatlink/outbox.json"

# Maximum queued messages (0 = unbounded; otherwise the oldest is dropped)
max_queue_len = 0

# Show the offline badge only after the link has been down this long (milliseconds)
badge_delay_ms = 1500

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.chatlink/logs/client.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 50

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

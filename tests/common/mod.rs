//! Common test utilities and fixtures
//!
//! This module provides shared test infrastructure

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use tempfile::TempDir;

/// Temporary home for one client: config file plus retry queue file
pub struct TestEnvironment {
    pub root: TempDir,
    pub config_path: PathBuf,
    pub queue_path: PathBuf,
}

impl TestEnvironment {
    /// Create an environment whose client points at `url`
    pub fn new(url: &str) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        let config_path = root.path().join("client.toml");
        let queue_path = root.path().join("state").join("outbox.json");

        let config = format!(
            r#"
[client]
name = "integration"
default_chat_id = "default_chat"

[connection]
url = "{url}"
reconnect_delay_ms = 200
ping_interval_ms = 20000
connect_timeout_ms = 2000

[network]
probe_enabled = false

[delivery]
queue_file = "{queue}"

[logging]
level = "warn"
"#,
            url = url,
            queue = queue_path.display()
        );
        fs::write(&config_path, config).expect("Failed to write config");

        Self {
            root,
            config_path,
            queue_path,
        }
    }

    pub fn config(&self) -> &str {
        self.config_path.to_str().expect("Non-UTF-8 temp path")
    }

    /// Command for the chatlink binary with no ambient overrides
    pub fn cmd(&self) -> Command {
        chatlink_cmd()
    }

    /// Raw queue file content, or an empty array when it does not exist
    pub fn queue_json(&self) -> serde_json::Value {
        match fs::read_to_string(&self.queue_path) {
            Ok(content) => serde_json::from_str(&content).expect("Queue file is not JSON"),
            Err(_) => serde_json::Value::Array(Vec::new()),
        }
    }
}

/// Command for the chatlink binary
pub fn chatlink_cmd() -> Command {
    let mut cmd = Command::cargo_bin("chatlink").expect("binary not built");
    cmd.env_remove("CHATLINK_CONFIG")
        .env_remove("CHATLINK_URL")
        .env_remove("CHATLINK_QUEUE_FILE")
        .env_remove("RUST_LOG");
    cmd
}

/// A ws:// URL on a local port with nothing listening
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("ws://127.0.0.1:{}", port)
}

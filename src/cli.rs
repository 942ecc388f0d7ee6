//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the chatlink client.

use clap::{Parser, Subcommand};

/// chatlink - Persistent-connection chat client
///
/// Keeps one WebSocket open to a chat endpoint, prints inbound messages and
/// sends each line read from stdin. Messages that cannot be sent are kept
/// in a durable queue and retried after every reconnect.
#[derive(Parser, Debug)]
#[command(name = "chatlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the client (connects, sends stdin lines, prints events)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "CHATLINK_CONFIG")]
        config: Option<String>,

        /// Conversation to send to (defaults to client.default_chat_id)
        #[arg(long)]
        chat: Option<String>,

        /// Seconds to wait for the queue to drain once stdin closes
        #[arg(long, default_value = "5")]
        drain_timeout: u64,

        /// Disable the reachability probe for this run
        #[arg(long)]
        no_probe: bool,
    },

    /// Inspect or clear the retry queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Retry queue subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum QueueSubcommand {
    /// List queued messages, oldest first
    List {
        /// Path to configuration file
        #[arg(short, long, env = "CHATLINK_CONFIG")]
        config: Option<String>,

        /// Print the queue as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drop every queued message
    Clear {
        /// Path to configuration file
        #[arg(short, long, env = "CHATLINK_CONFIG")]
        config: Option<String>,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

//! chatlink - Persistent-connection chat client
//!
//! This is the main entry point for the chatlink binary.
//! The client keeps a WebSocket open to the chat endpoint, sends lines read
//! from stdin and prints inbound messages and delivery status.

mod cli;
mod client;
mod config;
mod connection;
mod conversation;
mod delivery;
mod error;
mod logging;
mod protocol;
mod version;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cli::{Cli, Commands, ConfigSubcommand, QueueSubcommand};
use crate::client::{ChatClient, ClientEvent};
use crate::config::ClientConfig;
use crate::connection::{ReachabilityMonitor, WsConnector};
use crate::delivery::{JsonFileStore, RetryQueue};
use crate::error::{Error, Result};
use crate::logging::LogGuards;

/// Options for the `run` command
struct RunOptions {
    chat: Option<String>,
    drain_timeout: Duration,
    no_probe: bool,
}

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Queue { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_queue_command(subcommand.clone());
        }
        Commands::Run { .. } => {}
    }

    let Commands::Run {
        config,
        chat,
        drain_timeout,
        no_probe,
    } = cli.command
    else {
        return Ok(());
    };

    let config = load_or_exit(config.as_deref());

    // The guards must be kept alive for the lifetime of the program
    let _log_guards: LogGuards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting chatlink"
    );

    run_client(
        config,
        RunOptions {
            chat,
            drain_timeout: Duration::from_secs(drain_timeout),
            no_probe,
        },
    )
}

/// Load configuration, printing a formatted error and exiting on failure
fn load_or_exit(path: Option<&str>) -> ClientConfig {
    match ClientConfig::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    }
}

/// Run the interactive client
fn run_client(config: ClientConfig, options: RunOptions) -> Result<()> {
    info!(
        url = %config.connection.url,
        queue_file = %config.delivery.queue_file,
        probe = config.network.probe_enabled && !options.no_probe,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("chatlink")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_client_main(config, options))
}

/// What the main loop should do after a line of input
#[derive(Debug, PartialEq, Eq)]
enum LineAction {
    Continue,
    Quit,
}

async fn async_client_main(config: ClientConfig, options: RunOptions) -> Result<()> {
    let store = JsonFileStore::new(config.queue_file());
    debug!(path = %store.path().display(), "Using retry queue file");
    let (client, mut events) = ChatClient::start(&config, Arc::new(WsConnector), Box::new(store))?;

    let mut active_chat = options
        .chat
        .clone()
        .unwrap_or_else(|| client.default_chat().to_string());
    client.create_or_get_conversation(&active_chat);

    let probe = if config.network.probe_enabled && !options.no_probe {
        let url = Url::parse(&config.connection.url)
            .map_err(|e| Error::config_field_invalid("connection.url", e.to_string()))?;
        let monitor = ReachabilityMonitor::from_settings(&url, &config.network)?;
        Some(monitor.attach(client.supervisor()))
    } else {
        None
    };

    client.connect()?;
    info!(chat = %active_chat, "Client event loop started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => match handle_line(&client, &mut active_chat, line.trim()).await {
                    Ok(LineAction::Continue) => {}
                    Ok(LineAction::Quit) => break,
                    Err(e) if e.is_fatal() => {
                        error!(error = %e.format_for_log(), "Stopping after fatal error");
                        outcome = Err(e);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e.format_for_log(), "Command failed");
                        println!("! {}", e);
                    }
                },
                Ok(None) => {
                    debug!("stdin closed");
                    drain_queue(&client, &mut events, options.drain_timeout).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },

            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => {
                    info!("Client event channel closed");
                    break;
                }
            },
        }
    }

    if let Some(probe) = probe {
        probe.abort();
    }

    let remaining = client.queue_depth();
    if remaining > 0 {
        info!(remaining, "Undelivered messages kept for the next run");
    }
    client.shutdown().await?;
    outcome
}

/// Send a line, or run it as a slash command
async fn handle_line(client: &ChatClient, active_chat: &mut String, line: &str) -> Result<LineAction> {
    if line.is_empty() {
        return Ok(LineAction::Continue);
    }

    let Some(command) = line.strip_prefix('/') else {
        let sent = client.send(active_chat, line).await?;
        debug!(id = %sent.message.id, delivered = sent.delivered, "Line sent");
        return Ok(LineAction::Continue);
    };

    let mut parts = command.splitn(2, ' ');
    match (parts.next().unwrap_or(""), parts.next().map(str::trim)) {
        ("quit", _) | ("exit", _) => return Ok(LineAction::Quit),
        ("connect", _) => client.connect()?,
        ("disconnect", _) => client.disconnect()?,
        ("chat", Some(id)) if !id.is_empty() => {
            client.create_or_get_conversation(id);
            *active_chat = id.to_string();
            println!("* now chatting in {}", id);
        }
        ("chats", _) => {
            for chat in client.conversations() {
                let marker = if chat.id == *active_chat { "*" } else { " " };
                let last = chat.last_message().map(|m| m.content.as_str()).unwrap_or("");
                println!("{} {} ({} messages) {}", marker, chat.id, chat.messages.len(), last);
            }
        }
        ("history", _) => {
            if let Some(chat) = client.conversation(active_chat) {
                for message in &chat.messages {
                    let who = if message.outgoing {
                        "you"
                    } else {
                        message.sender.as_deref().unwrap_or("them")
                    };
                    println!(
                        "{} {}: {} [{}]",
                        message.timestamp.format("%H:%M:%S"),
                        who,
                        message.content,
                        message.status.as_str()
                    );
                }
            }
        }
        ("flush", _) => {
            let report = client.flush().await;
            println!(
                "* flushed: {} attempted, {} delivered, {} failed",
                report.attempted, report.delivered, report.failed
            );
        }
        ("queue", _) => println!("* {} message(s) queued", client.queue_depth()),
        ("discard", Some("all")) => println!("* discarded {} queued message(s)", client.clear_queue()?),
        ("discard", Some(id)) if !id.is_empty() => match client.discard(id)? {
            Some(message) => println!("* discarded {}: {}", message.id, message.payload),
            None => println!("! no queued message {}", id),
        },
        ("clear", _) => {
            client.clear_conversation(active_chat);
            println!("* cleared history of {}", active_chat);
        }
        ("network", Some("up")) => client.set_reachable(true)?,
        ("network", Some("down")) => client.set_reachable(false)?,
        ("state", _) => {
            let network = if client.is_reachable() { "reachable" } else { "unreachable" };
            println!("* connection: {} (network {})", client.state(), network);
        }
        _ => println!("! unknown command: /{}", command),
    }

    Ok(LineAction::Continue)
}

/// Keep printing events until the retry queue is empty or the timeout ends
async fn drain_queue(
    client: &ChatClient,
    events: &mut tokio::sync::mpsc::Receiver<ClientEvent>,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;

    while client.queue_depth() > 0 {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                debug!(remaining = client.queue_depth(), "Drain timeout reached");
                break;
            }
        }
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::ConnectionStateChanged(state) => println!("* connection: {}", state),
        ClientEvent::MessageReceived { chat_id, message } => {
            let who = message.sender.as_deref().unwrap_or("them");
            println!("[{}] {}: {}", chat_id, who, message.content);
        }
        ClientEvent::MessagePending { chat_id, message } => {
            debug!(chat = %chat_id, id = %message.id, "Message pending");
        }
        ClientEvent::MessageDelivered { chat_id, message_id } => {
            println!("[{}] delivered {}", chat_id, message_id);
        }
        ClientEvent::MessageDeliveryFailed {
            chat_id,
            message_id,
            reason,
        } => {
            debug!(chat = %chat_id, id = %message_id, reason = %reason, "Message not delivered");
        }
        ClientEvent::Notice(text) => println!("! {}", text),
        ClientEvent::QueueDepthChanged(depth) => debug!(depth, "Retry queue depth changed"),
        ClientEvent::ConnectivityBadge { visible: true } => println!("* offline"),
        ClientEvent::ConnectivityBadge { visible: false } => println!("* back online"),
    }
}

/// Handle retry queue subcommands
fn handle_queue_command(subcommand: QueueSubcommand) -> Result<()> {
    match subcommand {
        QueueSubcommand::List { config, json } => {
            let cfg = load_or_exit(config.as_deref());
            let entries = RetryQueue::open(Box::new(JsonFileStore::new(cfg.queue_file())), 0)?.snapshot();

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("Retry queue is empty.");
            } else {
                for entry in &entries {
                    println!(
                        "{}  {}  {}  attempts={}  {}",
                        entry.id,
                        entry.enqueued_at.to_rfc3339(),
                        entry.chat_id,
                        entry.delivery_attempts,
                        entry.payload
                    );
                }
                println!("{} message(s) queued.", entries.len());
            }
        }
        QueueSubcommand::Clear { config } => {
            let cfg = load_or_exit(config.as_deref());
            let queue = RetryQueue::recover(Box::new(JsonFileStore::new(cfg.queue_file())), 0);
            let count = queue.clear()?;
            println!("Cleared {} queued message(s).", count);
        }
    }

    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = ClientConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            load_or_exit(config.as_deref());
            println!("Configuration is valid.");
        }
    }

    Ok(())
}

//! Network reachability source
//!
//! Periodically probes whether the endpoint's host:port accepts TCP
//! connections and publishes changes. It never retries or backs off on its
//! own; the supervisor decides what an observation means.

use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use super::supervisor::ConnectionSupervisor;
use crate::config::NetworkSettings;
use crate::error::{Error, Result};

/// TCP reachability prober for one endpoint
#[derive(Debug, Clone)]
pub struct ReachabilityMonitor {
    host: String,
    port: u16,
    interval: Duration,
    timeout: Duration,
}

impl ReachabilityMonitor {
    pub fn new(host: impl Into<String>, port: u16, interval: Duration, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            interval,
            timeout,
        }
    }

    /// Probe the host and port the socket URL points at
    pub fn for_url(url: &Url, interval: Duration, timeout: Duration) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::config_field_invalid("connection.url", "URL has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::config_field_invalid("connection.url", "URL has no port"))?;

        Ok(Self::new(host, port, interval, timeout))
    }

    /// Build from the `[network]` section
    pub fn from_settings(url: &Url, settings: &NetworkSettings) -> Result<Self> {
        Self::for_url(
            url,
            Duration::from_millis(settings.probe_interval_ms),
            Duration::from_millis(settings.probe_timeout_ms),
        )
    }

    /// One reachability check
    pub async fn probe_once(&self) -> anyhow::Result<()> {
        let target = format!("{}:{}", self.host, self.port);
        tokio::time::timeout(self.timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| anyhow::anyhow!("Probe of {} timed out", target))?
            .with_context(|| format!("Probe of {} failed", target))?;
        Ok(())
    }

    /// Start probing; the receiver starts at `true` and only sees changes
    pub fn spawn(self) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(true);

        let handle = tokio::spawn(async move {
            let mut last = true;
            loop {
                let reachable = match self.probe_once().await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(error = %e, "Reachability probe failed");
                        false
                    }
                };

                if reachable != last {
                    info!(host = %self.host, port = self.port, reachable, "Reachability changed");
                    last = reachable;
                    if tx.send(reachable).is_err() {
                        break;
                    }
                }

                tokio::time::sleep(self.interval).await;
            }
        });

        (rx, handle)
    }

    /// Start probing and feed every change into the supervisor
    pub fn attach(self, supervisor: ConnectionSupervisor) -> JoinHandle<()> {
        let (mut rx, probe) = self.spawn();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let reachable = *rx.borrow_and_update();
                if supervisor.set_reachable(reachable).is_err() {
                    break;
                }
            }
            probe.abort();
        })
    }
}

//! Reference-counted sharing of serial links between devices.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::transport::{LinkSettings, TransportLink};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port '{port}'")]
    ConnectFailed { port: String },
}

#[derive(Debug)]
struct Entry {
    link: Arc<TransportLink>,
    refs: usize,
}

/// Owns every open [`TransportLink`], keyed by port.
///
/// Devices on the same bus share one link. The link is closed when the
/// last device releases it, or by [`close_all`](Self::close_all) at
/// shutdown.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: Mutex<HashMap<String, Entry>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the link for `port`, opening it on first use.
    pub async fn acquire(
        &self,
        port: &str,
        settings: LinkSettings,
    ) -> Result<Arc<TransportLink>, LinkError> {
        self.acquire_with(port, || TransportLink::new(port, settings))
            .await
    }

    /// Like [`acquire`](Self::acquire), with a custom constructor for new links.
    ///
    /// `make` is only called when no link for `port` exists yet.
    pub async fn acquire_with<F>(&self, port: &str, make: F) -> Result<Arc<TransportLink>, LinkError>
    where
        F: FnOnce() -> TransportLink,
    {
        let mut links = self.links.lock().await;

        if let Some(entry) = links.get_mut(port) {
            if !entry.link.is_connected() {
                info!(port, "Reconnecting shared link");
                if !entry.link.connect().await {
                    return Err(LinkError::ConnectFailed {
                        port: port.to_string(),
                    });
                }
            }
            entry.refs += 1;
            debug!(port, refs = entry.refs, "Reusing shared link");
            return Ok(entry.link.clone());
        }

        let link = Arc::new(make());
        if !link.connect().await {
            return Err(LinkError::ConnectFailed {
                port: port.to_string(),
            });
        }

        links.insert(
            port.to_string(),
            Entry {
                link: link.clone(),
                refs: 1,
            },
        );
        info!(port, "Registered new link");
        Ok(link)
    }

    /// Drop one reference to `port`; the last release closes the link.
    ///
    /// Releasing a port that is not registered is a no-op.
    pub async fn release(&self, port: &str) {
        let mut links = self.links.lock().await;

        let Some(entry) = links.get_mut(port) else {
            warn!(port, "Release of unknown port ignored");
            return;
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            debug!(port, refs = entry.refs, "Released shared link");
            return;
        }

        if let Some(entry) = links.remove(port) {
            entry.link.disconnect().await;
            info!(port, "Closed link after last release");
        }
    }

    /// Disconnect and forget every link.
    pub async fn close_all(&self) {
        let mut links = self.links.lock().await;
        let count = links.len();

        for (_, entry) in links.drain() {
            entry.link.disconnect().await;
        }

        if count > 0 {
            info!(count, "Closed all links");
        }
    }

    /// Current reference count for `port` (0 if unknown).
    pub async fn reference_count(&self, port: &str) -> usize {
        self.links
            .lock()
            .await
            .get(port)
            .map_or(0, |entry| entry.refs)
    }

    pub async fn is_port_in_use(&self, port: &str) -> bool {
        self.links.lock().await.contains_key(port)
    }

    /// Registered ports, sorted.
    pub async fn active_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.links.lock().await.keys().cloned().collect();
        ports.sort();
        ports
    }
}

//! Discovery operations on top of the key/value store.
//!
//! A registration lives at `<prefix>/services/<name>/<addr>`; its value is the
//! JSON attribute map, or `null` when the instance has no attributes. The
//! store's snapshot + change feed is normalized into one `ServiceUpdate`
//! stream per subscription.

use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use shared::protocol::{MISSED_HEARTBEAT_TTL_SECS, NO_ATTRS_SENTINEL};
use shared::types::{Attrs, ServiceUpdate};
use crate::error::{DiscoveryError, Result};
use crate::store::db::KvEntry;
use crate::store_manager::{StoreEvent, StoreEventKind, StoreHandle};

const UPDATE_BUFFER: usize = 64;

/// The capability set the agent serves
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Enumerate current instances of `name`, then follow changes
    async fn subscribe(&self, name: &str) -> Result<UpdateStream>;

    /// Create or overwrite a registration and reset its TTL
    async fn register(&self, name: &str, addr: &str, attrs: &Attrs) -> Result<()>;

    /// Remove a registration; `NotFound` if there is none
    async fn unregister(&self, name: &str, addr: &str) -> Result<()>;

    /// Reset a registration's TTL; `NotFound` if it already expired
    async fn heartbeat(&self, name: &str, addr: &str) -> Result<()>;
}

/// Receiving half of a subscription.
///
/// Closing (or dropping) the stream cancels the producer, including one
/// blocked on a full buffer.
pub struct UpdateStream {
    rx: mpsc::Receiver<ServiceUpdate>,
    cancel: CancellationToken,
}

/// Producing half of a subscription
pub struct UpdateSink {
    tx: mpsc::Sender<ServiceUpdate>,
    cancel: CancellationToken,
}

impl UpdateStream {
    pub fn channel(capacity: usize) -> (UpdateSink, UpdateStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        (
            UpdateSink { tx, cancel: cancel.clone() },
            UpdateStream { rx, cancel },
        )
    }

    /// Next update, `None` once the producer is gone or the stream is closed
    pub async fn recv(&mut self) -> Option<ServiceUpdate> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    /// Release the subscription. Safe to call more than once.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl UpdateSink {
    /// Deliver an update. Returns false once the consumer has closed the stream.
    pub async fn send(&self, update: ServiceUpdate) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(update) => sent.is_ok(),
        }
    }

    /// Resolves when the consumer closes or drops the stream
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Serialize attributes for storage; empty maps become the sentinel
pub fn encode_attrs(attrs: &Attrs) -> Result<String> {
    if attrs.is_empty() {
        return Ok(NO_ATTRS_SENTINEL.to_string());
    }
    Ok(serde_json::to_string(attrs)?)
}

/// Inverse of `encode_attrs`
pub fn decode_attrs(value: &str) -> Result<Attrs> {
    if value == NO_ATTRS_SENTINEL {
        return Ok(Attrs::new());
    }
    Ok(serde_json::from_str(value)?)
}

fn validate(name: &str, addr: Option<&str>) -> Result<()> {
    if name.is_empty() {
        return Err(DiscoveryError::InvalidArgument("service name is empty".into()));
    }
    if name.contains('/') {
        return Err(DiscoveryError::InvalidArgument(format!(
            "service name {:?} contains '/'",
            name
        )));
    }
    if addr.is_some_and(str::is_empty) {
        return Err(DiscoveryError::InvalidArgument("service address is empty".into()));
    }
    Ok(())
}

/// `DiscoveryBackend` over the embedded TTL key/value store
pub struct StoreBackend {
    store: StoreHandle,
    key_prefix: String,
    ttl: Duration,
}

impl StoreBackend {
    pub fn new(store: StoreHandle, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into().trim_end_matches('/').to_string(),
            ttl: Duration::from_secs(MISSED_HEARTBEAT_TTL_SECS),
        }
    }

    /// Override the registration lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Key prefix shared by all instances of `name`, trailing slash included
    pub fn service_dir(&self, name: &str) -> String {
        format!("{}/services/{}/", self.key_prefix, name)
    }

    /// Store key of one registration
    pub fn service_key(&self, name: &str, addr: &str) -> String {
        format!("{}{}", self.service_dir(name), addr)
    }
}

#[async_trait]
impl DiscoveryBackend for StoreBackend {
    async fn subscribe(&self, name: &str) -> Result<UpdateStream> {
        validate(name, None)?;

        let dir = self.service_dir(name);
        let (entries, events) = self.store.watch_prefix(dir.clone()).await?;
        let (sink, stream) = UpdateStream::channel(UPDATE_BUFFER);

        tokio::spawn(run_watch(name.to_string(), dir, entries, events, sink));
        Ok(stream)
    }

    async fn register(&self, name: &str, addr: &str, attrs: &Attrs) -> Result<()> {
        validate(name, Some(addr))?;
        let value = encode_attrs(attrs)?;
        self.store.put(self.service_key(name, addr), value, self.ttl).await?;
        Ok(())
    }

    async fn unregister(&self, name: &str, addr: &str) -> Result<()> {
        validate(name, Some(addr))?;
        if !self.store.delete(self.service_key(name, addr)).await? {
            return Err(DiscoveryError::NotFound {
                name: name.to_string(),
                addr: addr.to_string(),
            });
        }
        Ok(())
    }

    async fn heartbeat(&self, name: &str, addr: &str) -> Result<()> {
        validate(name, Some(addr))?;
        if !self.store.refresh(self.service_key(name, addr), self.ttl).await? {
            return Err(DiscoveryError::NotFound {
                name: name.to_string(),
                addr: addr.to_string(),
            });
        }
        Ok(())
    }
}

/// Producer task of one subscription: snapshot, sync marker, then live diffs
async fn run_watch(
    name: String,
    dir: String,
    entries: Vec<KvEntry>,
    mut events: broadcast::Receiver<StoreEvent>,
    sink: UpdateSink,
) {
    tracing::debug!("Watching {} ({} instances)", name, entries.len());

    for entry in entries {
        let Some(addr) = entry.key.strip_prefix(&dir) else {
            continue;
        };
        let attrs = match decode_attrs(&entry.value) {
            Ok(attrs) => attrs,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", entry.key, e);
                continue;
            }
        };
        let update = ServiceUpdate::Enumerated {
            name: name.clone(),
            addr: addr.to_string(),
            attrs,
        };
        if !sink.send(update).await {
            return;
        }
    }

    if !sink.send(ServiceUpdate::SyncComplete).await {
        return;
    }

    loop {
        let event = tokio::select! {
            _ = sink.closed() => break,
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Watch on {} lagged by {} events, closing", name, skipped);
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(addr) = event.key.strip_prefix(&dir) else {
            continue;
        };
        let update = match event.kind {
            StoreEventKind::Put(value) => match decode_attrs(&value) {
                Ok(attrs) => ServiceUpdate::Online {
                    name: name.clone(),
                    addr: addr.to_string(),
                    attrs,
                },
                Err(e) => {
                    tracing::warn!("Skipping update of {}: {}", event.key, e);
                    continue;
                }
            },
            StoreEventKind::Delete => ServiceUpdate::Offline {
                name: name.clone(),
                addr: addr.to_string(),
            },
        };

        if !sink.send(update).await {
            break;
        }
    }

    tracing::debug!("Watch on {} closed", name);
}

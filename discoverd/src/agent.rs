use std::sync::Arc;
use tokio::sync::mpsc;
use shared::types::{Attrs, ServiceUpdate};
use crate::backend::{DiscoveryBackend, UpdateStream};
use crate::error::Result;

const SUBSCRIBER_BUFFER: usize = 64;

/// Serves a `DiscoveryBackend` to remote clients.
///
/// Every subscriber gets its own backend subscription and forwarding task;
/// nothing is shared between subscribers.
#[derive(Clone)]
pub struct Agent {
    backend: Arc<dyn DiscoveryBackend>,
}

impl Agent {
    pub fn new(backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self { backend }
    }

    /// Open a subscription for one client.
    ///
    /// The returned receiver is the client's push channel. Dropping it is the
    /// disconnect signal: the forwarding task then closes the backend stream.
    pub async fn subscribe(&self, name: &str) -> Result<mpsc::Receiver<ServiceUpdate>> {
        let updates = match self.backend.subscribe(name).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::error!(service = %name, "Subscribe failed: {}", e);
                return Err(e);
            }
        };

        tracing::info!(service = %name, "Subscribe");
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(forward(name.to_string(), updates, tx));
        Ok(rx)
    }

    pub async fn register(&self, name: &str, addr: &str, attrs: &Attrs) -> Result<()> {
        let result = self.backend.register(name, addr, attrs).await;
        match &result {
            Ok(()) => tracing::info!(service = %name, addr = %addr, attrs = ?attrs, "Register"),
            Err(e) => tracing::warn!(service = %name, addr = %addr, "Register failed: {}", e),
        }
        result
    }

    pub async fn unregister(&self, name: &str, addr: &str) -> Result<()> {
        let result = self.backend.unregister(name, addr).await;
        match &result {
            Ok(()) => tracing::info!(service = %name, addr = %addr, "Unregister"),
            Err(e) => tracing::warn!(service = %name, addr = %addr, "Unregister failed: {}", e),
        }
        result
    }

    pub async fn heartbeat(&self, name: &str, addr: &str) -> Result<()> {
        let result = self.backend.heartbeat(name, addr).await;
        match &result {
            Ok(()) => tracing::debug!(service = %name, addr = %addr, "Heartbeat"),
            Err(e) => tracing::warn!(service = %name, addr = %addr, "Heartbeat failed: {}", e),
        }
        result
    }
}

/// Copy backend updates to one subscriber until either side goes away
async fn forward(name: String, mut updates: UpdateStream, tx: mpsc::Sender<ServiceUpdate>) {
    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = tx.closed() => {
                tracing::info!(service = %name, "Subscriber disconnected");
                updates.close();
                return;
            }
        };

        let Some(update) = update else {
            tracing::debug!(service = %name, "Backend stream ended");
            return;
        };

        if tx.send(update).await.is_err() {
            tracing::info!(service = %name, "Subscriber disconnected");
            updates.close();
            return;
        }
    }
}

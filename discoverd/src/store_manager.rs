use std::thread;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use anyhow::{anyhow, Result};
use chrono::Utc;
use crate::store::db::{KvDb, KvEntry};

/// Change published to watchers after every mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    pub kind: StoreEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEventKind {
    /// Key written or refreshed, carrying its current value
    Put(String),
    /// Key deleted explicitly or by expiry
    Delete,
}

/// Commands sent to the store thread
pub enum StoreCommand {
    Get(String, oneshot::Sender<Result<Option<String>>>),
    Put {
        key: String,
        value: String,
        ttl: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Refresh {
        key: String,
        ttl: Duration,
        reply: oneshot::Sender<Result<bool>>,
    },
    Delete(String, oneshot::Sender<Result<bool>>),
    Watch(String, oneshot::Sender<Result<(Vec<KvEntry>, broadcast::Receiver<StoreEvent>)>>),
    Expire(oneshot::Sender<Result<usize>>),
    Shutdown,
}

/// Handle to the key/value store thread
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn publish(events: &broadcast::Sender<StoreEvent>, key: String, kind: StoreEventKind) {
    // No watchers is not an error
    let _ = events.send(StoreEvent { key, kind });
}

/// Remove keys past their deadline, publishing a delete for each
fn reap(db: &KvDb, events: &broadcast::Sender<StoreEvent>, now: i64) -> Result<usize> {
    let keys = db.take_expired(now)?;
    let count = keys.len();
    for key in keys {
        tracing::debug!("Expired {}", key);
        publish(events, key, StoreEventKind::Delete);
    }
    Ok(count)
}

fn deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl StoreHandle {
    /// Spawn the store thread owning `db`. Each watcher may fall at most
    /// `watch_capacity` events behind before it is cut off.
    pub fn spawn(db: KvDb, watch_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);
        let (events, _) = broadcast::channel::<StoreEvent>(watch_capacity.max(1));

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Get(key, reply) => {
                        let _ = reply.send(db.get(&key, now_millis()));
                    }
                    StoreCommand::Put { key, value, ttl, reply } => {
                        let result = db.put(&key, &value, deadline(now_millis(), ttl));
                        if result.is_ok() {
                            publish(&events, key, StoreEventKind::Put(value));
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Refresh { key, ttl, reply } => {
                        let now = now_millis();
                        let result = db.refresh(&key, deadline(now, ttl), now);
                        let found = match result {
                            Ok(Some(value)) => {
                                publish(&events, key, StoreEventKind::Put(value));
                                Ok(true)
                            }
                            Ok(None) => Ok(false),
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(found);
                    }
                    StoreCommand::Delete(key, reply) => {
                        let result = db.delete(&key, now_millis());
                        if matches!(result, Ok(true)) {
                            publish(&events, key, StoreEventKind::Delete);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Watch(prefix, reply) => {
                        // Subscribing on the store thread makes the snapshot and
                        // the event stream meet exactly, nothing lost or repeated.
                        // Keys already past their deadline are reaped first, so a
                        // watcher never sees a delete for a key its snapshot lacks.
                        let now = now_millis();
                        let result = reap(&db, &events, now)
                            .and_then(|_| db.list_prefix(&prefix, now))
                            .map(|entries| (entries, events.subscribe()));
                        let _ = reply.send(result);
                    }
                    StoreCommand::Expire(reply) => {
                        let _ = reply.send(reap(&db, &events, now_millis()));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(&self, cmd: StoreCommand, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("store thread has shut down"))?;
        rx.await.map_err(|_| anyhow!("store thread dropped the request"))?
    }

    /// Value of a live key
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::Get(key.into(), reply), rx).await
    }

    /// Write a key that expires after `ttl`
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCommand::Put {
                key: key.into(),
                value: value.into(),
                ttl,
                reply,
            },
            rx,
        )
        .await
    }

    /// Extend a live key's lifetime; watchers see it as a put of the
    /// unchanged value. Returns false if the key does not exist.
    pub async fn refresh(&self, key: impl Into<String>, ttl: Duration) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(
            StoreCommand::Refresh {
                key: key.into(),
                ttl,
                reply,
            },
            rx,
        )
        .await
    }

    /// Delete a live key. Returns false if it did not exist.
    pub async fn delete(&self, key: impl Into<String>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::Delete(key.into(), reply), rx).await
    }

    /// Current entries under `prefix` plus a receiver for every later change.
    /// The receiver sees all keys; callers filter by prefix themselves.
    pub async fn watch_prefix(
        &self,
        prefix: impl Into<String>,
    ) -> Result<(Vec<KvEntry>, broadcast::Receiver<StoreEvent>)> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::Watch(prefix.into(), reply), rx).await
    }

    /// Reap expired keys, publishing a delete for each. Returns how many.
    pub async fn expire(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(StoreCommand::Expire(reply), rx).await
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| anyhow!("store thread has shut down"))?;
        Ok(())
    }
}

/// Expiry loop - periodically reaps keys whose TTL ran out
pub async fn run(
    store: StoreHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut expiry_interval = tokio::time::interval(interval);
    expiry_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = expiry_interval.tick() => {
                match store.expire().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!("Expired {} registrations", count),
                    Err(e) => tracing::error!("Failed to expire registrations: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Expiry loop shutting down");
                break;
            }
        }
    }

    Ok(())
}

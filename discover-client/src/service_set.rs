use std::collections::HashMap;
use std::sync::{Arc, Weak};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::types::{Attrs, Service, ServiceUpdate};
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Pending,
    Synced,
    /// Stream ended before the sync marker arrived
    Failed,
}

struct State {
    services: HashMap<String, Attrs>,
    filter: Option<Attrs>,
    listeners: Vec<flume::Sender<ServiceUpdate>>,
    closed: bool,
}

impl State {
    fn admits(&self, attrs: &Attrs) -> bool {
        self.filter.as_ref().map_or(true, |filter| matches(attrs, filter))
    }

    /// Deliver to every listener, forgetting those that hung up
    fn notify(&mut self, update: &ServiceUpdate) {
        self.listeners.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

struct Inner {
    name: String,
    state: RwLock<State>,
    sync: watch::Sender<SyncState>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Live, filterable view of the online instances of one service.
///
/// Cloning is cheap and every clone sees the same set. The background task
/// feeding the set stops when the last clone is dropped or `close` is called;
/// after that the set keeps its last contents.
#[derive(Clone)]
pub struct ServiceSet {
    inner: Arc<Inner>,
}

/// True when `attrs` carries every key/value pair of `criteria`
pub fn matches(attrs: &Attrs, criteria: &Attrs) -> bool {
    criteria.iter().all(|(k, v)| attrs.get(k) == Some(v))
}

impl ServiceSet {
    /// An empty set for `name`, fed through `apply`
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (sync, _) = watch::channel(SyncState::Pending);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: RwLock::new(State {
                    services: HashMap::new(),
                    filter: None,
                    listeners: Vec::new(),
                    closed: false,
                }),
                sync,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Online instances that pass the filter, ordered by address
    pub fn services(&self) -> Vec<Service> {
        let state = self.inner.state.read();
        let mut services: Vec<Service> = state
            .services
            .iter()
            .map(|(addr, attrs)| Service {
                name: self.inner.name.clone(),
                addr: addr.clone(),
                attrs: attrs.clone(),
            })
            .collect();
        services.sort_by(|a, b| a.addr.cmp(&b.addr));
        services
    }

    /// Addresses of `services()`
    pub fn addrs(&self) -> Vec<String> {
        self.services().into_iter().map(|s| s.addr).collect()
    }

    /// Members matching `criteria`, without touching the standing filter
    pub fn select(&self, criteria: &Attrs) -> Vec<Service> {
        self.services()
            .into_iter()
            .filter(|s| matches(&s.attrs, criteria))
            .collect()
    }

    /// Replace the standing filter.
    ///
    /// Members that fail the new filter are removed right away and reported
    /// to listeners as offline. Instances excluded earlier are only admitted
    /// when a fresh update for them arrives. Empty criteria clear the filter.
    pub fn filter(&self, criteria: Attrs) {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        state.filter = if criteria.is_empty() { None } else { Some(criteria) };

        let mut excluded: Vec<String> = state
            .services
            .iter()
            .filter(|(_, attrs)| !state.filter.as_ref().map_or(true, |f| matches(attrs, f)))
            .map(|(addr, _)| addr.clone())
            .collect();
        excluded.sort();

        for addr in excluded {
            state.services.remove(&addr);
            let update = ServiceUpdate::Offline {
                name: self.inner.name.clone(),
                addr,
            };
            state.notify(&update);
        }
    }

    /// Apply one update from the service's update stream.
    ///
    /// Updates must be applied in stream order; the set serializes
    /// concurrent callers.
    pub(crate) fn apply(&self, update: ServiceUpdate) {
        let mut state = self.inner.state.write();

        match &update {
            ServiceUpdate::SyncComplete => {
                drop(state);
                self.inner.sync.send_replace(SyncState::Synced);
            }
            ServiceUpdate::Offline { addr, .. } => {
                if state.services.remove(addr).is_some() {
                    state.notify(&update);
                }
            }
            ServiceUpdate::Enumerated { name, addr, attrs }
            | ServiceUpdate::Online { name, addr, attrs } => {
                if state.admits(attrs) {
                    // Heartbeats re-announce unchanged instances
                    if state.services.insert(addr.clone(), attrs.clone()).as_ref() != Some(attrs) {
                        state.notify(&update);
                    }
                } else if state.services.remove(addr).is_some() {
                    let removed = ServiceUpdate::Offline {
                        name: name.clone(),
                        addr: addr.clone(),
                    };
                    state.notify(&removed);
                }
            }
        }
    }

    /// Receive every accepted change: additions and in-place updates as they
    /// arrived, removals (including filter pruning) as `Offline`
    pub fn watch(&self) -> flume::Receiver<ServiceUpdate> {
        let (tx, rx) = flume::unbounded();
        self.inner.state.write().listeners.push(tx);
        rx
    }

    /// Whether the initial enumeration has been fully applied
    pub fn is_synced(&self) -> bool {
        *self.inner.sync.borrow() == SyncState::Synced
    }

    /// Wait until the initial enumeration has been fully applied.
    ///
    /// Fails with `StreamClosed` if the stream ends first.
    pub async fn wait_synced(&self) -> Result<()> {
        let mut rx = self.inner.sync.subscribe();
        let state = *rx
            .wait_for(|state| *state != SyncState::Pending)
            .await
            .map_err(|_| ClientError::StreamClosed)?;

        match state {
            SyncState::Synced => Ok(()),
            _ => Err(ClientError::StreamClosed),
        }
    }

    /// Stop following the update stream. The contents stay readable.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether the set has stopped receiving updates
    pub fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakServiceSet {
        WeakServiceSet(Arc::downgrade(&self.inner))
    }

    /// Record that no more updates will arrive
    pub(crate) fn mark_closed(&self) {
        self.inner.state.write().closed = true;
        self.inner.sync.send_if_modified(|state| {
            if *state == SyncState::Pending {
                *state = SyncState::Failed;
                true
            } else {
                false
            }
        });
    }
}

/// Handle held by the feeding task so it does not keep the set alive
pub(crate) struct WeakServiceSet(Weak<Inner>);

impl WeakServiceSet {
    pub(crate) fn upgrade(&self) -> Option<ServiceSet> {
        self.0.upgrade().map(|inner| ServiceSet { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn online(addr: &str, pairs: &[(&str, &str)]) -> ServiceUpdate {
        ServiceUpdate::Online {
            name: "svc".into(),
            addr: addr.into(),
            attrs: attrs(pairs),
        }
    }

    fn offline(addr: &str) -> ServiceUpdate {
        ServiceUpdate::Offline {
            name: "svc".into(),
            addr: addr.into(),
        }
    }

    #[test]
    fn test_online_and_offline() {
        let set = ServiceSet::new("svc");
        set.apply(ServiceUpdate::Enumerated {
            name: "svc".into(),
            addr: "2222".into(),
            attrs: Attrs::new(),
        });
        set.apply(online("1111", &[("foo", "bar")]));
        assert_eq!(set.addrs(), vec!["1111", "2222"]);

        set.apply(offline("2222"));
        set.apply(offline("9999"));
        let services = set.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].attrs["foo"], "bar");
        assert_eq!(services[0].name, "svc");
    }

    #[test]
    fn test_reregister_updates_in_place() {
        let set = ServiceSet::new("svc");
        set.apply(online("1111", &[("foo", "bar")]));
        let changes = set.watch();

        set.apply(online("1111", &[("foo", "baz")]));
        assert_eq!(set.services()[0].attrs["foo"], "baz");

        // Only the replacement is reported, never an intermediate removal
        assert_eq!(changes.try_recv().unwrap(), online("1111", &[("foo", "baz")]));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_refresh_with_same_attrs_is_quiet() {
        let set = ServiceSet::new("svc");
        set.apply(online("1111", &[("foo", "bar")]));
        let changes = set.watch();

        set.apply(online("1111", &[("foo", "bar")]));
        assert_eq!(set.addrs(), vec!["1111"]);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_filter_prunes_and_guards_admission() {
        let set = ServiceSet::new("svc");
        set.apply(online("a", &[("foo", "bar")]));
        set.apply(online("b", &[("foo", "baz")]));
        let changes = set.watch();

        set.filter(attrs(&[("foo", "bar")]));
        assert_eq!(set.addrs(), vec!["a"]);
        assert_eq!(changes.try_recv().unwrap(), offline("b"));

        set.apply(online("c", &[("foo", "bar")]));
        set.apply(online("d", &[("foo", "baz")]));
        assert_eq!(set.addrs(), vec!["a", "c"]);

        // A member whose attributes stop matching leaves the set
        set.apply(online("a", &[("foo", "qux")]));
        assert_eq!(set.addrs(), vec!["c"]);
        assert_eq!(changes.try_recv().unwrap(), online("c", &[("foo", "bar")]));
        assert_eq!(changes.try_recv().unwrap(), offline("a"));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_filter_does_not_readmit() {
        let set = ServiceSet::new("svc");
        set.filter(attrs(&[("foo", "bar")]));
        set.apply(online("a", &[("foo", "baz")]));
        assert!(set.services().is_empty());

        set.filter(Attrs::new());
        assert!(set.services().is_empty());

        set.apply(online("a", &[("foo", "baz")]));
        assert_eq!(set.addrs(), vec!["a"]);
    }

    #[test]
    fn test_select_leaves_filter_alone() {
        let set = ServiceSet::new("svc");
        set.apply(online("2222", &[("foo", "qux"), ("id", "2")]));
        set.apply(online("3333", &[("foo", "qux"), ("id", "3")]));

        let selected = set.select(&attrs(&[("id", "3")]));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].addr, "3333");
        assert_eq!(set.services().len(), 2);
        assert!(set.select(&Attrs::new()).len() == 2);
    }

    #[test]
    fn test_offline_for_unknown_is_silent() {
        let set = ServiceSet::new("svc");
        let changes = set.watch();

        set.apply(offline("nobody"));
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let set = ServiceSet::new("svc");
        let kept = set.watch();
        drop(set.watch());

        set.apply(online("a", &[]));
        assert_eq!(set.inner.state.read().listeners.len(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_wait_synced() {
        let set = ServiceSet::new("svc");
        assert!(!set.is_synced());

        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.wait_synced().await })
        };
        set.apply(online("a", &[]));
        set.apply(ServiceUpdate::SyncComplete);

        waiter.await.unwrap().unwrap();
        assert!(set.is_synced());

        // Closing after sync keeps the set synced
        set.mark_closed();
        assert!(set.is_closed());
        set.wait_synced().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_synced_fails_when_stream_ends_early() {
        let set = ServiceSet::new("svc");
        set.mark_closed();
        assert!(matches!(set.wait_synced().await, Err(ClientError::StreamClosed)));
    }

    #[test]
    fn test_weak_handle_does_not_keep_set_alive() {
        let set = ServiceSet::new("svc");
        let token = set.cancel_token();
        let weak = set.downgrade();
        assert!(weak.upgrade().is_some());

        drop(set);
        assert!(weak.upgrade().is_none());
        assert!(token.is_cancelled());
    }
}

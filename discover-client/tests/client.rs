use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use discover_client::{
    Attrs, Client, ClientError, ServiceSet, ServiceUpdate, DEFAULT_HEARTBEAT_INTERVAL,
};
use discoverd::agent::Agent;
use discoverd::backend::StoreBackend;
use discoverd::store::db::KvDb;
use discoverd::store_manager::{self, StoreHandle};
use shared::protocol::MISSED_HEARTBEAT_TTL_SECS;

const WAIT: Duration = Duration::from_secs(5);

/// An agent on an ephemeral port, stopped when dropped
struct TestAgent {
    addr: String,
    cancel: CancellationToken,
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_agent(ttl: Duration) -> TestAgent {
    let store = StoreHandle::spawn(KvDb::open(":memory:").unwrap(), 1024);
    let cancel = CancellationToken::new();
    tokio::spawn(store_manager::run(store.clone(), Duration::from_millis(1), cancel.clone()));

    let backend = StoreBackend::new(store, "/discover").with_ttl(ttl);
    let agent = Agent::new(Arc::new(backend));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(discoverd::serve(listener, agent, Duration::from_secs(15), cancel.clone()));

    TestAgent { addr, cancel }
}

fn attrs(pairs: &[(&str, &str)]) -> Attrs {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn has_addr(set: &ServiceSet, addr: &str) {
    eventually(addr, || set.addrs().iter().any(|a| a == addr)).await;
}

async fn next(updates: &mut discover_client::Subscription) -> ServiceUpdate {
    tokio::time::timeout(WAIT, updates.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("bad update")
}

#[tokio::test]
async fn test_client() {
    let agent = start_agent(Duration::from_secs(30)).await;
    let client = Client::connect(&agent.addr).await.unwrap();
    let name = "testService";

    client.register(name, "1111", attrs(&[("foo", "bar")])).await.unwrap();
    client.register(name, "2222", Attrs::new()).await.unwrap();

    let set = client.query_services(name).await.unwrap();
    set.wait_synced().await.unwrap();
    assert_eq!(set.addrs(), vec!["1111", "2222"]);

    client.unregister(name, "2222").await.unwrap();
    eventually("2222 offline", || set.services().len() == 1).await;
    assert_eq!(set.services()[0].attrs["foo"], "bar");

    client.register(name, "1111", attrs(&[("foo", "baz")])).await.unwrap();
    eventually("attrs replaced", || set.services()[0].attrs["foo"] == "baz").await;

    client.register(name, "2222", attrs(&[("foo", "qux"), ("id", "2")])).await.unwrap();
    has_addr(&set, "2222").await;

    set.filter(attrs(&[("foo", "qux")]));
    assert_eq!(set.addrs(), vec!["2222"]);

    client.register(name, "3333", attrs(&[("foo", "qux"), ("id", "3")])).await.unwrap();
    has_addr(&set, "3333").await;

    // 4444 is excluded by the filter; 5555 arriving afterwards proves 4444 was seen
    client.register(name, "4444", attrs(&[("foo", "baz")])).await.unwrap();
    client.register(name, "5555", attrs(&[("foo", "qux"), ("id", "5")])).await.unwrap();
    has_addr(&set, "5555").await;
    assert_eq!(set.addrs(), vec!["2222", "3333", "5555"]);

    let selected = set.select(&attrs(&[("id", "3")]));
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].addr, "3333");
}

#[tokio::test]
async fn test_no_services() {
    let agent = start_agent(Duration::from_secs(30)).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    let set = client.query_services("nonexistent").await.unwrap();
    set.wait_synced().await.unwrap();
    assert!(set.services().is_empty());
}

#[tokio::test]
async fn test_watch_not_called_for_offline_of_unknown_services() {
    let agent = start_agent(Duration::from_secs(30)).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    client.register("watched", "10.0.0.1", Attrs::new()).await.unwrap();
    let set = client.query_services("watched").await.unwrap();
    set.wait_synced().await.unwrap();
    set.filter(attrs(&[("role", "primary")]));
    assert!(set.services().is_empty());
    let changes = set.watch();

    // Offline for an instance the set never held must not reach listeners
    client.unregister("watched", "10.0.0.1").await.unwrap();
    client.register("watched", "10.0.0.2", attrs(&[("role", "primary")])).await.unwrap();

    let first = tokio::time::timeout(WAIT, changes.recv_async()).await.unwrap().unwrap();
    assert_eq!(first.addr(), Some("10.0.0.2"));
    assert!(first.is_online());
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribe_enumeration_then_diffs() {
    let agent = start_agent(Duration::from_secs(30)).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    for addr in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
        client.register("svc", addr, Attrs::new()).await.unwrap();
    }

    let mut updates = client.subscribe("svc").await.unwrap();
    let mut enumerated = Vec::new();
    loop {
        match next(&mut updates).await {
            ServiceUpdate::Enumerated { addr, .. } => enumerated.push(addr),
            ServiceUpdate::SyncComplete => break,
            other => panic!("diff before sync: {:?}", other),
        }
    }
    enumerated.sort();
    assert_eq!(enumerated, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);

    client.register("svc", "10.0.0.5", Attrs::new()).await.unwrap();
    client.unregister("svc", "10.0.0.5").await.unwrap();

    let online = next(&mut updates).await;
    assert!(matches!(online, ServiceUpdate::Online { .. }));
    assert_eq!(online.addr(), Some("10.0.0.5"));
    assert_eq!(
        next(&mut updates).await,
        ServiceUpdate::Offline { name: "svc".into(), addr: "10.0.0.5".into() }
    );
}

#[tokio::test]
async fn test_missed_heartbeats_expire() {
    let agent = start_agent(Duration::from_millis(300)).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    let set = client.query_services("svc").await.unwrap();
    set.wait_synced().await.unwrap();
    let changes = set.watch();

    client.register("svc", "silent", Attrs::new()).await.unwrap();
    let kept = client
        .register_with_heartbeat("svc", "alive", Attrs::new(), Duration::from_millis(50))
        .await
        .unwrap();

    let removed = tokio::time::timeout(WAIT, async {
        loop {
            let update = changes.recv_async().await.unwrap();
            if !update.is_online() {
                return update;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(removed, ServiceUpdate::Offline { name: "svc".into(), addr: "silent".into() });
    assert_eq!(set.addrs(), vec!["alive"]);

    // Several TTLs later the heartbeated registration is still there
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(set.addrs(), vec!["alive"]);

    assert!(matches!(
        client.heartbeat("svc", "silent").await,
        Err(ClientError::NotFound(_))
    ));

    kept.unregister().await.unwrap();
    eventually("alive to go offline", || set.services().is_empty()).await;
}

/// Heartbeat at `interval` against a TTL of the same length for `span`,
/// failing on any offline report for the registration
async fn assert_stays_online(ttl: Duration, interval: Duration, span: Duration) {
    let agent = start_agent(ttl).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    let set = client.query_services("svc").await.unwrap();
    set.wait_synced().await.unwrap();
    let changes = set.watch();

    let kept = client
        .register_with_heartbeat("svc", "a", Attrs::new(), interval)
        .await
        .unwrap();
    has_addr(&set, "a").await;

    tokio::time::sleep(span).await;
    let offline: Vec<_> = changes.drain().filter(|u| !u.is_online()).collect();
    assert!(offline.is_empty(), "heartbeating registration went offline: {:?}", offline);
    assert_eq!(set.addrs(), vec!["a"]);
    client.heartbeat("svc", "a").await.unwrap();

    kept.unregister().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_at_ttl_keeps_registration() {
    let ttl = Duration::from_millis(200);
    assert_stays_online(ttl, ttl, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_default_heartbeat_keeps_default_ttl_registration() {
    let ttl = Duration::from_secs(MISSED_HEARTBEAT_TTL_SECS);
    assert_stays_online(ttl, DEFAULT_HEARTBEAT_INTERVAL, ttl * 2 + Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_errors_are_typed() {
    let agent = start_agent(Duration::from_secs(30)).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    assert!(matches!(
        client.unregister("svc", "missing").await,
        Err(ClientError::NotFound(_))
    ));
    assert!(matches!(
        client.register("", "10.0.0.1", Attrs::new()).await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.subscribe("a/b").await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.query_services("").await,
        Err(ClientError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_connect_fails_without_agent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    assert!(matches!(
        Client::connect(&addr).await,
        Err(ClientError::Transport(_))
    ));
}

#[tokio::test]
async fn test_set_keeps_snapshot_after_agent_stops() {
    let agent = start_agent(Duration::from_secs(30)).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    client.register("svc", "10.0.0.1", HashMap::new()).await.unwrap();
    let set = client.query_services("svc").await.unwrap();
    set.wait_synced().await.unwrap();

    drop(agent);
    eventually("set to close", || set.is_closed()).await;
    assert_eq!(set.addrs(), vec!["10.0.0.1"]);
}

#[tokio::test]
async fn test_closing_set_stops_updates() {
    let agent = start_agent(Duration::from_secs(30)).await;
    let client = Client::connect(&agent.addr).await.unwrap();

    let set = client.query_services("svc").await.unwrap();
    set.wait_synced().await.unwrap();
    set.close();
    eventually("set to close", || set.is_closed()).await;

    client.register("svc", "10.0.0.1", Attrs::new()).await.unwrap();
    let fresh = client.query_services("svc").await.unwrap();
    has_addr(&fresh, "10.0.0.1").await;
    assert!(set.services().is_empty());
}

//! End-to-end tests driving the load balancer through mock collaborators:
//! a scripted service discoverer, a scripted connection factory, and an
//! in-memory connection type.

use async_trait::async_trait;
use coxswain::{
    BoxError, ConnectionFactory, DiscoveryEvent, EventBatch, HealthCheckConfig,
    LoadBalancedConnection, LoadBalancer, LoadBalancerConfig, LoadBalancerError, ReadyEvent,
    RequestContext, ServiceDiscoverer,
};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct TestConnection {
    inner: Arc<ConnInner>,
}

#[derive(Debug)]
struct ConnInner {
    address: String,
    reserved: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl TestConnection {
    fn new(address: &str) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnInner {
                address: address.to_string(),
                reserved: AtomicBool::new(false),
                closed_tx,
            }),
        }
    }

    fn address(&self) -> &str {
        &self.inner.address
    }

    /// Release a reservation, returning the connection to the idle pool.
    fn release(&self) {
        self.inner.reserved.store(false, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }
}

impl LoadBalancedConnection for TestConnection {
    fn try_reserve(&self) -> bool {
        !self.inner.reserved.swap(true, Ordering::SeqCst)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.inner.closed_tx.subscribe();
        Box::pin(async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn close(&self, _graceful: bool) -> BoxFuture<'static, ()> {
        self.inner.closed_tx.send_replace(true);
        Box::pin(async {})
    }
}

#[derive(Default)]
struct MockFactory {
    failing: Mutex<HashSet<String>>,
    built: Mutex<Vec<TestConnection>>,
    factory_closed: AtomicBool,
}

impl MockFactory {
    fn fail(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    fn heal(&self, address: &str) {
        self.failing.lock().unwrap().remove(address);
    }

    fn built_count(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    fn built_for(&self, address: &str) -> Vec<TestConnection> {
        self.built
            .lock()
            .unwrap()
            .iter()
            .filter(|conn| conn.address() == address)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConnectionFactory<String, TestConnection> for MockFactory {
    async fn connect(
        &self,
        address: &String,
        _context: &RequestContext,
    ) -> Result<TestConnection, BoxError> {
        if self.failing.lock().unwrap().contains(address) {
            return Err(format!("connect to {address} refused").into());
        }
        let conn = TestConnection::new(address);
        self.built.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    async fn close(&self, _graceful: bool) {
        self.factory_closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockDiscoverer {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<EventBatch<String>, BoxError>>>>,
    subscriptions: AtomicUsize,
}

impl MockDiscoverer {
    fn emit(&self, batch: EventBatch<String>) {
        let subscribers = self.subscribers.lock().unwrap();
        let tx = subscribers.last().expect("no active subscription");
        let _ = tx.send(Ok(batch));
    }

    fn emit_error(&self, message: &str) {
        let subscribers = self.subscribers.lock().unwrap();
        let tx = subscribers.last().expect("no active subscription");
        let _ = tx.send(Err(message.to_string().into()));
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl ServiceDiscoverer<String> for MockDiscoverer {
    fn subscribe(&self) -> BoxStream<'static, Result<EventBatch<String>, BoxError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    lb: LoadBalancer<String, TestConnection>,
    discoverer: Arc<MockDiscoverer>,
    factory: Arc<MockFactory>,
}

fn harness(config: LoadBalancerConfig) -> Harness {
    let discoverer = Arc::new(MockDiscoverer::default());
    let factory = Arc::new(MockFactory::default());
    let lb: LoadBalancer<String, TestConnection> = LoadBalancer::builder("test-service")
        .config(config)
        .build(
            Arc::clone(&discoverer) as Arc<dyn ServiceDiscoverer<String>>,
            Arc::clone(&factory) as Arc<dyn ConnectionFactory<String, TestConnection>>,
        )
        .expect("valid config");
    Harness {
        lb,
        discoverer,
        factory,
    }
}

fn no_health() -> LoadBalancerConfig {
    LoadBalancerConfig {
        health_check: None,
        ..LoadBalancerConfig::default()
    }
}

/// Health checking with probes pushed far into the future, so tests
/// exercise quarantine and resubscribe without probe interference.
fn quarantine_only(threshold: u32) -> LoadBalancerConfig {
    LoadBalancerConfig {
        health_check: Some(HealthCheckConfig {
            failure_threshold: threshold,
            probe_interval: Duration::from_secs(3600),
            probe_jitter: Duration::ZERO,
            resubscribe_lower: Duration::ZERO,
            resubscribe_upper: Duration::ZERO,
        }),
        ..LoadBalancerConfig::default()
    }
}

fn available(address: &str) -> DiscoveryEvent<String> {
    DiscoveryEvent::available(address.to_string())
}

fn expired(address: &str) -> DiscoveryEvent<String> {
    DiscoveryEvent::expired(address.to_string())
}

fn unavailable(address: &str) -> DiscoveryEvent<String> {
    DiscoveryEvent::unavailable(address.to_string())
}

fn pass_all(_conn: &TestConnection) -> bool {
    true
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_hosts(harness: &Harness, count: usize) {
    let lb = &harness.lb;
    wait_until(|| lb.snapshot().len() == count).await;
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_then_available() {
    let h = harness(no_health());
    let mut events = h.lb.event_stream();
    let ctx = RequestContext::new();

    // Nothing discovered yet.
    let err = h.lb.select_connection(pass_all, &ctx).await.unwrap_err();
    assert!(matches!(err, LoadBalancerError::NoHostsAvailable));

    // An empty batch changes nothing.
    h.discoverer.emit(vec![]);
    let err = h.lb.select_connection(pass_all, &ctx).await.unwrap_err();
    assert!(matches!(err, LoadBalancerError::NoHostsAvailable));

    // One available address: readiness fires and selection succeeds.
    h.discoverer.emit(vec![available("a")]);
    assert_eq!(events.next().await, Some(Ok(ReadyEvent::Ready)));

    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(conn.address(), "a");
    assert_eq!(h.factory.built_count(), 1);
}

#[tokio::test]
async fn test_round_robin_cycles() {
    let h = harness(no_health());
    let ctx = RequestContext::new();

    h.discoverer
        .emit(vec![available("a"), available("b"), available("c")]);
    wait_for_hosts(&h, 3).await;

    let mut picked = Vec::new();
    for _ in 0..6 {
        let conn = h.lb.new_connection(&ctx).await.unwrap();
        picked.push(conn.address().to_string());
    }
    assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
}

#[tokio::test]
async fn test_health_quarantine() {
    let h = harness(quarantine_only(3));
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a"), available("b")]);
    wait_for_hosts(&h, 2).await;
    h.factory.fail("b");

    // A reject-all filter forces a build on every selection. Builds on
    // "b" fail and the selector falls through to "a"; after three
    // failures "b" is quarantined.
    for _ in 0..6 {
        let conn = h
            .lb
            .select_connection(|_: &TestConnection| false, &ctx)
            .await
            .unwrap();
        assert_eq!(conn.address(), "a");
    }
    let snapshot = h.lb.snapshot();
    let b = snapshot.iter().find(|s| s.address == "b").unwrap();
    assert_eq!(b.state, coxswain::HostState::Unhealthy);

    // The quarantined host is skipped outright now.
    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(conn.address(), "a");
}

#[tokio::test]
async fn test_expired_host_drains_then_disappears() {
    let h = harness(no_health());
    let mut events = h.lb.event_stream();
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a")]);
    assert_eq!(events.next().await, Some(Ok(ReadyEvent::Ready)));

    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    conn.release();

    h.discoverer.emit(vec![expired("a")]);
    let lb = &h.lb;
    wait_until(|| {
        lb.snapshot()
            .first()
            .is_some_and(|s| s.state == coxswain::HostState::Expired)
    })
    .await;

    // Still selectable for reuse while draining.
    let reused = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(reused.address(), "a");
    assert_eq!(h.factory.built_count(), 1);

    // The caller closes the last connection; the host drains out of the
    // list and readiness drops.
    reused.close(false).await;
    wait_until(|| lb.snapshot().is_empty()).await;
    assert_eq!(events.next().await, Some(Ok(ReadyEvent::NotReady)));

    let err = h.lb.select_connection(pass_all, &ctx).await.unwrap_err();
    assert!(matches!(err, LoadBalancerError::NoHostsAvailable));
}

#[tokio::test]
async fn test_all_unhealthy_triggers_resubscribe() {
    let h = harness(quarantine_only(1));
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a"), available("b")]);
    wait_for_hosts(&h, 2).await;
    assert_eq!(h.discoverer.subscription_count(), 1);

    h.factory.fail("a");
    h.factory.fail("b");

    // The first selection quarantines both hosts on its way through the
    // rotation and surfaces the final build failure.
    let err = h.lb.select_connection(pass_all, &ctx).await.unwrap_err();
    assert!(matches!(err, LoadBalancerError::ConnectionFailed { .. }));
    let lb = &h.lb;
    wait_until(|| {
        lb.snapshot()
            .iter()
            .all(|s| s.state == coxswain::HostState::Unhealthy)
    })
    .await;

    // The next selection sees no active host and wins the resubscribe
    // race (the window is zero).
    let err = h.lb.select_connection(pass_all, &ctx).await.unwrap_err();
    assert!(matches!(err, LoadBalancerError::NoActiveHost));

    let discoverer = Arc::clone(&h.discoverer);
    wait_until(move || discoverer.subscription_count() == 2).await;
}

#[tokio::test]
async fn test_stateless_discoverer_reconciliation_after_resubscribe() {
    let h = harness(quarantine_only(1));
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a"), available("b")]);
    wait_for_hosts(&h, 2).await;

    h.factory.fail("a");
    h.factory.fail("b");
    let _ = h.lb.select_connection(pass_all, &ctx).await;
    let lb = &h.lb;
    wait_until(|| {
        lb.snapshot()
            .iter()
            .all(|s| s.state == coxswain::HostState::Unhealthy)
    })
    .await;
    let _ = h.lb.select_connection(pass_all, &ctx).await;

    let discoverer = Arc::clone(&h.discoverer);
    wait_until(move || discoverer.subscription_count() == 2).await;

    // The fresh subscription reports only "a": a stateless discoverer
    // started from scratch. "b" must be drained away; "a" is revived.
    h.factory.heal("a");
    h.discoverer.emit(vec![available("a")]);

    wait_until(|| {
        let snapshot = lb.snapshot();
        snapshot.len() == 1
            && snapshot[0].address == "a"
            && snapshot[0].state == coxswain::HostState::Active
    })
    .await;

    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(conn.address(), "a");
}

#[tokio::test]
async fn test_stateful_discoverer_list_left_alone_after_resubscribe() {
    let h = harness(quarantine_only(1));
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a"), available("b")]);
    wait_for_hosts(&h, 2).await;

    h.factory.fail("a");
    h.factory.fail("b");
    let _ = h.lb.select_connection(pass_all, &ctx).await;
    let _ = h.lb.select_connection(pass_all, &ctx).await;

    let discoverer = Arc::clone(&h.discoverer);
    wait_until(move || discoverer.subscription_count() == 2).await;

    // First batch after resubscribe carries a non-available status: the
    // discoverer kept its state, so "b" stays in the list.
    h.factory.heal("a");
    h.discoverer.emit(vec![available("a"), expired("b")]);

    let lb = &h.lb;
    wait_until(|| {
        lb.snapshot()
            .iter()
            .any(|s| s.address == "a" && s.state == coxswain::HostState::Active)
    })
    .await;
    // "b" had no pooled connections, so the expired event closed it; the
    // important part is that the reconciliation path did not force-drain
    // hosts merely for being absent.
    assert!(lb.snapshot().iter().all(|s| s.address == "a"));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unavailable_closes_host_and_connections() {
    let h = harness(no_health());
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a"), available("b")]);
    wait_for_hosts(&h, 2).await;

    let first = h.lb.new_connection(&ctx).await.unwrap();
    let second = h.lb.new_connection(&ctx).await.unwrap();
    assert_eq!(first.address(), "a");
    assert_eq!(second.address(), "b");

    h.discoverer.emit(vec![unavailable("b")]);
    let lb = &h.lb;
    wait_until(|| lb.snapshot().len() == 1).await;
    assert_eq!(lb.snapshot()[0].address, "a");

    let second = second.clone();
    wait_until(move || second.is_closed()).await;
    assert!(!first.is_closed());
}

#[tokio::test]
async fn test_close_shuts_everything_down() {
    let h = harness(no_health());
    let mut events = h.lb.event_stream();
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a")]);
    assert_eq!(events.next().await, Some(Ok(ReadyEvent::Ready)));

    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    h.lb.close(true).await;

    assert!(conn.is_closed());
    assert!(h.factory.factory_closed.load(Ordering::SeqCst));
    assert!(h.lb.snapshot().is_empty());

    // The event stream completes.
    assert!(events.next().await.is_none());

    // New requests are rejected, and a second close resolves immediately.
    let err = h.lb.select_connection(pass_all, &ctx).await.unwrap_err();
    assert!(matches!(err, LoadBalancerError::Closed(_)));
    h.lb.close(true).await;
}

#[tokio::test]
async fn test_readiness_replays_to_late_subscribers() {
    let h = harness(no_health());

    h.discoverer.emit(vec![available("a")]);
    wait_for_hosts(&h, 1).await;

    let mut late = h.lb.event_stream();
    assert_eq!(late.next().await, Some(Ok(ReadyEvent::Ready)));
}

#[tokio::test]
async fn test_discovery_error_without_health_checking_fails_stream() {
    let h = harness(no_health());
    let mut events = h.lb.event_stream();

    h.discoverer.emit_error("resolver down");
    match events.next().await {
        Some(Err(LoadBalancerError::Discovery(message))) => {
            assert!(message.contains("resolver down"));
        }
        other => panic!("expected discovery error, got {other:?}"),
    }
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn test_discovery_error_with_health_checking_keeps_hosts() {
    let h = harness(quarantine_only(3));
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a")]);
    wait_for_hosts(&h, 1).await;

    h.discoverer.emit_error("resolver blip");
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The last-known host set keeps serving.
    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(conn.address(), "a");
}

#[tokio::test]
async fn test_duplicate_address_in_batch_last_wins() {
    let h = harness(no_health());
    let ctx = RequestContext::new();

    h.discoverer
        .emit(vec![available("a"), unavailable("a"), available("b")]);
    wait_for_hosts(&h, 1).await;
    assert_eq!(h.lb.snapshot()[0].address, "b");

    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(conn.address(), "b");
}

#[tokio::test(start_paused = true)]
async fn test_probe_revives_quarantined_host() {
    let config = LoadBalancerConfig {
        health_check: Some(HealthCheckConfig {
            failure_threshold: 1,
            probe_interval: Duration::from_secs(5),
            probe_jitter: Duration::from_secs(1),
            resubscribe_lower: Duration::from_secs(3600),
            resubscribe_upper: Duration::from_secs(7200),
        }),
        ..LoadBalancerConfig::default()
    };
    let h = harness(config);
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a")]);
    wait_for_hosts(&h, 1).await;

    h.factory.fail("a");
    let err = h.lb.select_connection(pass_all, &ctx).await.unwrap_err();
    assert!(matches!(err, LoadBalancerError::ConnectionFailed { .. }));
    let lb = &h.lb;
    wait_until(|| {
        lb.snapshot()
            .first()
            .is_some_and(|s| s.state == coxswain::HostState::Unhealthy)
    })
    .await;

    // Let the probe find a healthy backend.
    h.factory.heal("a");
    wait_until(|| {
        lb.snapshot()
            .first()
            .is_some_and(|s| s.state == coxswain::HostState::Active)
    })
    .await;

    // The probe parked a fresh connection in the pool; selection reuses it.
    let probed = h.factory.built_for("a");
    assert!(!probed.is_empty());
    let conn = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(conn.address(), "a");
}

#[tokio::test]
async fn test_reserved_connections_are_not_shared() {
    let h = harness(no_health());
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a")]);
    wait_for_hosts(&h, 1).await;

    let first = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    // The first connection is still reserved; a second selection must
    // build rather than hand out the same one.
    let second = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(h.factory.built_count(), 2);

    first.release();
    second.release();
    let third = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    assert_eq!(h.factory.built_count(), 2);
    drop(third);
}

#[tokio::test]
async fn test_filter_applies_to_reused_connections_only() {
    let h = harness(no_health());
    let ctx = RequestContext::new();

    h.discoverer.emit(vec![available("a")]);
    wait_for_hosts(&h, 1).await;

    let first = h.lb.select_connection(pass_all, &ctx).await.unwrap();
    first.release();

    // The filter rejects the pooled connection, so a new one is built
    // and returned without being filtered.
    let second = h
        .lb
        .select_connection(|_: &TestConnection| false, &ctx)
        .await
        .unwrap();
    assert_eq!(second.address(), "a");
    assert_eq!(h.factory.built_count(), 2);
}

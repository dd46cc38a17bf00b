//! Load balancer lifecycle root.
//!
//! Owns the host list, subscribes the service discoverer, and serializes
//! every host-list mutation through a single-writer executor. Requests
//! read lock-free snapshots published behind an atomic pointer swap.

use crate::config::{HealthCheckConfig, LoadBalancerConfig};
use crate::connection::{
    ConnectionFactory, ConnectionFilter, LoadBalancedConnection, RequestContext,
};
use crate::discovery::{DiscoveryEvent, ResolvedAddress, ServiceDiscoverer};
use crate::error::{BoxError, LoadBalancerError, LoadBalancerResult};
use crate::host::{DrainedHook, HealthContext, Host, HostState};
use crate::readiness::{EventStream, ReadinessSender, ReadyEvent};
use crate::reconcile;
use crate::selector::{RoundRobinSelector, Selector};
use crate::serial::SerialExecutor;
use crate::time::{self, TimeSource, TokioClock};
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sentinel stored in `next_resubscribe` while a resubscribe is in
/// flight; also the initial value when health checking is disabled, which
/// keeps resubscribe from ever firing.
const RESUBSCRIBING: u64 = u64::MAX;

/// Load balancer statistics.
#[derive(Debug, Default)]
pub struct LoadBalancerStats {
    /// Total selections attempted.
    pub total_selections: AtomicU64,
    /// Selections that produced a connection.
    pub successful_selections: AtomicU64,
    /// Selections that failed (no host, no active host, build failure).
    pub failed_selections: AtomicU64,
    /// Connections built by the factory, including probe builds.
    pub connections_built: AtomicU64,
}

impl LoadBalancerStats {
    pub(crate) fn record_selection(&self, success: bool) {
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_selections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_selections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_connection(&self) {
        self.connections_built.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of one host, for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct HostSnapshot<A> {
    /// Resolved address.
    pub address: A,
    /// Health state at snapshot time.
    pub state: HostState,
    /// Number of pooled connections at snapshot time.
    pub pooled_connections: usize,
}

struct SubscriptionHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared<A, C> {
    target: String,
    config: LoadBalancerConfig,
    time: Arc<dyn TimeSource>,
    factory: Arc<dyn ConnectionFactory<A, C>>,
    discoverer: Arc<dyn ServiceDiscoverer<A>>,
    selector: Arc<dyn Selector<A, C>>,
    /// Immutable snapshot of the host list; swapped only by the writer.
    hosts: ArcSwap<Vec<Arc<Host<A, C>>>>,
    readiness: ReadinessSender,
    writer: SerialExecutor,
    stats: Arc<LoadBalancerStats>,
    is_closed: AtomicBool,
    close_started: AtomicBool,
    close_done: watch::Sender<bool>,
    /// Nanosecond timestamp after which a resubscribe may fire, or
    /// [`RESUBSCRIBING`].
    next_resubscribe: AtomicU64,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl<A, C> Shared<A, C>
where
    A: ResolvedAddress,
    C: LoadBalancedConnection,
{
    fn now_nanos(&self) -> u64 {
        self.time.now().as_nanos() as u64
    }

    fn compute_next_resubscribe(&self, health: &HealthCheckConfig) -> u64 {
        let delay = time::uniform_between(health.resubscribe_lower, health.resubscribe_upper);
        let next = self.now_nanos().saturating_add(delay.as_nanos() as u64);
        debug!(
            lb = %self.target,
            next_resubscribe_nanos = next,
            "Next resubscribe attempt scheduled"
        );
        next
    }

    fn start_subscription(self: &Arc<Self>, resubscribe: bool) {
        if resubscribe {
            debug!(lb = %self.target, "Resubscribing to the service discoverer");
        }
        let token = CancellationToken::new();
        let mut stream = self.discoverer.subscribe();
        let weak = Arc::downgrade(self);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let mut first_after_resubscribe = resubscribe;
            loop {
                let item = tokio::select! {
                    () = task_token.cancelled() => return,
                    item = stream.next() => item,
                };
                let Some(shared) = weak.upgrade() else { return };
                match item {
                    Some(Ok(batch)) => {
                        if batch.is_empty() {
                            debug!(lb = %shared.target, "Ignoring empty discovery batch");
                            continue;
                        }
                        let first = std::mem::replace(&mut first_after_resubscribe, false);
                        let job_shared = Arc::clone(&shared);
                        shared.writer.execute(move || {
                            job_shared.sequential_on_batch(&batch, first);
                        });
                    }
                    Some(Err(error)) => {
                        shared.on_discovery_error(&error);
                        return;
                    }
                    None => {
                        shared.on_discovery_complete();
                        return;
                    }
                }
            }
        });
        *self
            .subscription
            .lock()
            .expect("subscription lock poisoned") = Some(SubscriptionHandle { token, task });
    }

    /// Apply one discovery batch. Runs only on the single-writer executor.
    fn sequential_on_batch(
        self: &Arc<Self>,
        batch: &[DiscoveryEvent<A>],
        first_after_resubscribe: bool,
    ) {
        if self.is_closed.load(Ordering::Acquire) {
            return;
        }
        let old = self.hosts.load_full();
        let (next, added_hosts) =
            reconcile::apply_batch(&old, batch, |address| self.new_host(address));
        let next = Arc::new(next);
        self.hosts.store(Arc::clone(&next));
        debug!(
            lb = %self.target,
            hosts = next.len(),
            events = batch.len(),
            "Applied discovery batch"
        );
        if next.is_empty() {
            self.readiness.emit(ReadyEvent::NotReady);
        } else if added_hosts {
            self.readiness.emit(ReadyEvent::Ready);
        }

        if first_after_resubscribe && reconcile::only_available(batch) {
            // A discoverer that is stateless across subscriptions starts
            // from scratch and reports only available addresses. Any host
            // it no longer mentions is gone as far as it is concerned, so
            // drain those to stay in sync. A first batch carrying other
            // statuses means the discoverer kept its state; leave the list
            // alone.
            for host in next.iter() {
                if !reconcile::in_batch(host.address(), batch) {
                    info!(
                        lb = %self.target,
                        address = %host.address(),
                        "Host absent from first batch after resubscribe; draining"
                    );
                    let host = Arc::clone(host);
                    tokio::spawn(async move {
                        host.close(true).await;
                    });
                }
            }
        }
    }

    fn new_host(self: &Arc<Self>, address: &A) -> Arc<Host<A, C>> {
        debug!(lb = %self.target, address = %address, "Creating host");
        let weak = Arc::downgrade(self);
        let hook: DrainedHook<A, C> = Arc::new(move |host: &Arc<Host<A, C>>| {
            let Some(shared) = weak.upgrade() else { return };
            let host = Arc::downgrade(host);
            let job_shared = Arc::clone(&shared);
            shared.writer.execute(move || {
                // The host is kept alive by the list; a failed upgrade
                // means it was already removed.
                let Some(host) = host.upgrade() else { return };
                job_shared.remove_host(&host);
            });
        });
        let health = self
            .config
            .health_check
            .as_ref()
            .map(|config| HealthContext {
                config: config.clone(),
                time: Arc::clone(&self.time),
            });
        Host::new(
            self.target.clone(),
            address.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.stats),
            self.config.linear_search_space,
            health,
            hook,
        )
    }

    /// Drop a fully drained host from the list. Runs only on the
    /// single-writer executor.
    fn remove_host(self: &Arc<Self>, host: &Arc<Host<A, C>>) {
        let current = self.hosts.load_full();
        if current.is_empty() {
            return;
        }
        let next: Vec<_> = current
            .iter()
            .filter(|candidate| !Arc::ptr_eq(candidate, host))
            .cloned()
            .collect();
        if next.len() == current.len() {
            return;
        }
        let empty = next.is_empty();
        debug!(
            lb = %self.target,
            address = %host.address(),
            hosts = next.len(),
            "Removed drained host"
        );
        self.hosts.store(Arc::new(next));
        if empty {
            self.readiness.emit(ReadyEvent::NotReady);
        }
    }

    fn on_discovery_error(&self, err: &BoxError) {
        let hosts = self.hosts.load();
        error!(
            lb = %self.target,
            hosts = hosts.len(),
            error = %err,
            "Service discoverer emitted an error"
        );
        if self.config.health_check.is_none() {
            // No resubscribe will ever happen; terminate the event stream.
            self.readiness.fail(err.to_string());
        }
    }

    fn on_discovery_complete(&self) {
        let hosts = self.hosts.load();
        error!(
            lb = %self.target,
            hosts = hosts.len(),
            "Service discoverer completed"
        );
        if self.config.health_check.is_none() {
            self.readiness.complete();
        }
    }

    /// Opportunistically resubscribe the discovery stream after a
    /// selection found every host unhealthy. At most one resubscribe is
    /// ever in flight: the CAS to [`RESUBSCRIBING`] elects the winner.
    fn maybe_resubscribe(self: &Arc<Self>, hosts: &[Arc<Host<A, C>>]) {
        if self.config.health_check.is_none() || !all_unhealthy(hosts) {
            return;
        }
        let current = self.next_resubscribe.load(Ordering::Acquire);
        if current == RESUBSCRIBING || self.now_nanos() < current {
            return;
        }
        if self
            .next_resubscribe
            .compare_exchange(current, RESUBSCRIBING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(
                lb = %self.target,
                "Every host is unhealthy; resubscribing to service discovery"
            );
            self.spawn_resubscribe();
        }
    }

    fn spawn_resubscribe(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let previous = shared
                .subscription
                .lock()
                .expect("subscription lock poisoned")
                .take();
            if let Some(previous) = previous {
                previous.token.cancel();
                // The old subscription must be fully torn down before the
                // new one is established.
                if previous.task.await.is_err() {
                    warn!(lb = %shared.target, "Previous subscription task panicked");
                }
            }
            if shared.is_closed.load(Ordering::Acquire) {
                return;
            }
            shared.start_subscription(true);
            if let Some(health) = &shared.config.health_check {
                let next = shared.compute_next_resubscribe(health);
                shared.next_resubscribe.store(next, Ordering::Release);
            }
        });
    }

    /// Close sequence head. Runs only on the single-writer executor.
    fn sequential_close(self: &Arc<Self>, graceful: bool) {
        self.is_closed.store(true, Ordering::Release);
        if let Some(subscription) = self
            .subscription
            .lock()
            .expect("subscription lock poisoned")
            .take()
        {
            subscription.token.cancel();
        }
        self.readiness.complete();

        let hosts = self.hosts.load_full();
        debug!(
            lb = %self.target,
            hosts = hosts.len(),
            graceful,
            "Closing hosts and connection factory"
        );
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            join_all(hosts.iter().map(|host| host.close(graceful))).await;
            shared.factory.close(graceful).await;
            let writer_shared = Arc::clone(&shared);
            shared.writer.execute(move || {
                writer_shared.hosts.store(Arc::new(Vec::new()));
                writer_shared.close_done.send_replace(true);
            });
        });
    }
}

fn all_unhealthy<A, C>(hosts: &[Arc<Host<A, C>>]) -> bool
where
    A: ResolvedAddress,
    C: LoadBalancedConnection,
{
    !hosts.is_empty() && hosts.iter().all(|host| host.is_unhealthy())
}

/// Builder for [`LoadBalancer`].
pub struct LoadBalancerBuilder<A, C> {
    target: String,
    config: LoadBalancerConfig,
    time: Arc<dyn TimeSource>,
    selector: Arc<dyn Selector<A, C>>,
}

impl<A, C> LoadBalancerBuilder<A, C>
where
    A: ResolvedAddress,
    C: LoadBalancedConnection,
{
    fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            config: LoadBalancerConfig::default(),
            time: Arc::new(TokioClock::new()),
            selector: Arc::new(RoundRobinSelector::new()),
        }
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: LoadBalancerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the time source (probe scheduling, resubscribe window).
    #[must_use]
    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Replace the host selector.
    #[must_use]
    pub fn selector(mut self, selector: Arc<dyn Selector<A, C>>) -> Self {
        self.selector = selector;
        self
    }

    /// Validate the configuration, subscribe the discoverer, and start
    /// the balancer. Must be called from within a tokio runtime.
    pub fn build(
        self,
        discoverer: Arc<dyn ServiceDiscoverer<A>>,
        factory: Arc<dyn ConnectionFactory<A, C>>,
    ) -> LoadBalancerResult<LoadBalancer<A, C>> {
        self.config.validate()?;

        let (close_done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            target: self.target,
            config: self.config,
            time: self.time,
            factory,
            discoverer,
            selector: self.selector,
            hosts: ArcSwap::from_pointee(Vec::new()),
            readiness: ReadinessSender::new(),
            writer: SerialExecutor::new(),
            stats: Arc::new(LoadBalancerStats::default()),
            is_closed: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
            close_done,
            next_resubscribe: AtomicU64::new(RESUBSCRIBING),
            subscription: Mutex::new(None),
        });

        info!(
            lb = %shared.target,
            selector = shared.selector.name(),
            health_checking = shared.config.health_check.is_some(),
            "Starting load balancer"
        );
        shared.start_subscription(false);
        if let Some(health) = &shared.config.health_check {
            let next = shared.compute_next_resubscribe(health);
            shared.next_resubscribe.store(next, Ordering::Release);
        }
        Ok(LoadBalancer { shared })
    }
}

/// A client-side load balancer over a service-discovered set of hosts.
pub struct LoadBalancer<A, C> {
    shared: Arc<Shared<A, C>>,
}

impl<A, C> LoadBalancer<A, C>
where
    A: ResolvedAddress,
    C: LoadBalancedConnection,
{
    /// Start building a load balancer for `target`, a human-readable name
    /// of the balanced resource used in logs and errors.
    pub fn builder(target: impl Into<String>) -> LoadBalancerBuilder<A, C> {
        LoadBalancerBuilder::new(target)
    }

    /// Select a connection for a request, preferring an idle pooled
    /// connection that passes `filter` and falling back to a new build.
    pub async fn select_connection<F>(
        &self,
        filter: F,
        context: &RequestContext,
    ) -> LoadBalancerResult<Arc<C>>
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.select0(&filter, context, false).await
    }

    /// Build a guaranteed-fresh connection, bypassing every pool.
    pub async fn new_connection(&self, context: &RequestContext) -> LoadBalancerResult<Arc<C>> {
        self.select0(&|_: &C| true, context, true).await
    }

    async fn select0(
        &self,
        filter: &ConnectionFilter<C>,
        context: &RequestContext,
        force_new: bool,
    ) -> LoadBalancerResult<Arc<C>> {
        let shared = &self.shared;
        let hosts = shared.hosts.load_full();
        if hosts.is_empty() {
            shared.stats.record_selection(false);
            return Err(if shared.is_closed.load(Ordering::Acquire) {
                LoadBalancerError::Closed(shared.target.clone())
            } else {
                // Discovery has emitted, but nothing is currently usable.
                LoadBalancerError::NoHostsAvailable
            });
        }
        match shared
            .selector
            .select(&hosts, filter, context, force_new)
            .await
        {
            Ok(conn) => {
                shared.stats.record_selection(true);
                Ok(conn)
            }
            Err(err) => {
                shared.stats.record_selection(false);
                if matches!(err, LoadBalancerError::NoActiveHost) {
                    shared.maybe_resubscribe(&hosts);
                }
                Err(err)
            }
        }
    }

    /// Subscribe to readiness events. The stream replays the most recent
    /// event to late subscribers.
    pub fn event_stream(&self) -> EventStream {
        self.shared.readiness.subscribe()
    }

    /// Point-in-time view of the host list.
    pub fn snapshot(&self) -> Vec<HostSnapshot<A>> {
        self.shared
            .hosts
            .load()
            .iter()
            .map(|host| HostSnapshot {
                address: host.address().clone(),
                state: host.state(),
                pooled_connections: host.connection_count(),
            })
            .collect()
    }

    /// Selection and build counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<LoadBalancerStats> {
        &self.shared.stats
    }

    /// The balanced resource name.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Close the balancer: cancel the discovery subscription, close every
    /// host and the connection factory, and complete the event stream.
    /// Idempotent; a second call waits for the first to finish.
    pub async fn close(&self, graceful: bool) {
        let shared = &self.shared;
        let mut done = shared.close_done.subscribe();
        if !shared.close_started.swap(true, Ordering::AcqRel) {
            info!(lb = %shared.target, graceful, "Closing load balancer");
            let job_shared = Arc::clone(shared);
            shared.writer.execute(move || {
                job_shared.sequential_close(graceful);
            });
        }
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

impl<A, C> fmt::Debug for LoadBalancer<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("target", &self.shared.target)
            .field("hosts", &self.shared.hosts.load().len())
            .field("closed", &self.shared.is_closed.load(Ordering::Relaxed))
            .finish()
    }
}

//! Per-host connection pool and health state machine.
//!
//! A [`Host`] owns one resolved backend address, its pool of reusable
//! connections, and its health state. Connect failures are counted per
//! host; once the configured threshold is crossed the host is quarantined
//! and a single background probe attempts to revive it with jittered
//! backoff.

use crate::balancer::LoadBalancerStats;
use crate::config::HealthCheckConfig;
use crate::connection::{ConnectionFactory, ConnectionFilter, LoadBalancedConnection, RequestContext};
use crate::discovery::ResolvedAddress;
use crate::error::{LoadBalancerError, LoadBalancerResult};
use crate::time::{self, TimeSource};
use futures_util::future::join_all;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health state of a host.
///
/// `Closed` is terminal; `Expired` is reachable only from `Active` and a
/// host in `Expired` with an empty pool transitions to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Healthy and eligible for reuse and new connection builds.
    Active,
    /// Being retired: pooled connections may still be reused, new builds
    /// are rejected. The host closes itself once its pool drains.
    Expired,
    /// Quarantined after consecutive connect failures; skipped by the
    /// selector while a background probe attempts revival.
    Unhealthy,
    /// Terminal.
    Closed,
}

impl HostState {
    /// Whether the selector may consider this host at all.
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::Active | Self::Expired)
    }
}

/// Health-checking context shared by every host of one balancer.
#[derive(Clone)]
pub(crate) struct HealthContext {
    pub(crate) config: HealthCheckConfig,
    pub(crate) time: Arc<dyn TimeSource>,
}

/// Callback invoked exactly once when a host has fully closed and should
/// be dropped from the host list. Captures only weak references back to
/// the balancer.
pub(crate) type DrainedHook<A, C> = Arc<dyn Fn(&Arc<Host<A, C>>) + Send + Sync>;

struct HostInner<C> {
    state: HostState,
    /// Insertion-ordered pool; the reuse scan walks the first
    /// `linear_search_space` entries.
    connections: Vec<Arc<C>>,
    consecutive_failures: u32,
    probe: Option<CancellationToken>,
    drained_hook_fired: bool,
}

/// One backend address with its connection pool and health state.
pub struct Host<A, C> {
    target: String,
    address: A,
    factory: Arc<dyn ConnectionFactory<A, C>>,
    stats: Arc<LoadBalancerStats>,
    linear_search_space: usize,
    health: Option<HealthContext>,
    on_drained: DrainedHook<A, C>,
    inner: Mutex<HostInner<C>>,
}

impl<A, C> Host<A, C>
where
    A: ResolvedAddress,
    C: LoadBalancedConnection,
{
    pub(crate) fn new(
        target: String,
        address: A,
        factory: Arc<dyn ConnectionFactory<A, C>>,
        stats: Arc<LoadBalancerStats>,
        linear_search_space: usize,
        health: Option<HealthContext>,
        on_drained: DrainedHook<A, C>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            address,
            factory,
            stats,
            linear_search_space,
            health,
            on_drained,
            inner: Mutex::new(HostInner {
                state: HostState::Active,
                connections: Vec::new(),
                consecutive_failures: 0,
                probe: None,
                drained_hook_fired: false,
            }),
        })
    }

    /// The resolved address this host represents.
    #[must_use]
    pub fn address(&self) -> &A {
        &self.address
    }

    /// Current health state.
    #[must_use]
    pub fn state(&self) -> HostState {
        self.inner.lock().expect("host lock poisoned").state
    }

    /// Whether the host is quarantined.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        self.state() == HostState::Unhealthy
    }

    /// Number of pooled connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .expect("host lock poisoned")
            .connections
            .len()
    }

    /// Pick a reusable connection or build a new one.
    ///
    /// With `force_new` set the pool is bypassed entirely. An `Expired`
    /// host serves pooled reservations only; a build attempt against it
    /// fails with [`LoadBalancerError::HostNotActive`].
    pub async fn select_or_build(
        self: &Arc<Self>,
        filter: &ConnectionFilter<C>,
        context: &RequestContext,
        force_new: bool,
    ) -> LoadBalancerResult<Arc<C>> {
        {
            let inner = self.inner.lock().expect("host lock poisoned");
            if !inner.state.is_selectable() {
                return Err(LoadBalancerError::HostNotActive(self.address.to_string()));
            }
            if !force_new {
                let scan = inner.connections.len().min(self.linear_search_space);
                for conn in inner.connections.iter().take(scan) {
                    if filter(conn) && conn.try_reserve() {
                        return Ok(Arc::clone(conn));
                    }
                }
            }
            if inner.state == HostState::Expired {
                return Err(LoadBalancerError::HostNotActive(self.address.to_string()));
            }
        }
        self.build_connection(context).await
    }

    async fn build_connection(self: &Arc<Self>, context: &RequestContext) -> LoadBalancerResult<Arc<C>> {
        match self.factory.connect(&self.address, context).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                if !conn.try_reserve() {
                    conn.close(false).await;
                    return Err(LoadBalancerError::ConnectionFailed {
                        address: self.address.to_string(),
                        message: "freshly built connection refused reservation".to_string(),
                    });
                }
                self.adopt_connection(&conn)?;
                self.stats.record_connection();
                Ok(conn)
            }
            Err(error) => {
                debug!(
                    lb = %self.target,
                    address = %self.address,
                    error = %error,
                    "Connection build failed"
                );
                self.record_build_failure();
                Err(LoadBalancerError::connection_failed(&self.address, &error))
            }
        }
    }

    /// Append a freshly built connection to the pool, resetting the
    /// failure counter and reviving an unhealthy host.
    fn adopt_connection(self: &Arc<Self>, conn: &Arc<C>) -> LoadBalancerResult<()> {
        let revived = {
            let mut inner = self.inner.lock().expect("host lock poisoned");
            if inner.state == HostState::Closed {
                drop(inner);
                // The host closed while the factory was connecting; the
                // connection must not outlive it.
                tokio::spawn(conn.close(true));
                return Err(LoadBalancerError::HostNotActive(self.address.to_string()));
            }
            inner.consecutive_failures = 0;
            inner.connections.push(Arc::clone(conn));
            if inner.state == HostState::Unhealthy {
                inner.state = HostState::Active;
                if let Some(probe) = inner.probe.take() {
                    probe.cancel();
                }
                true
            } else {
                false
            }
        };
        if revived {
            info!(
                lb = %self.target,
                address = %self.address,
                "Host revived by a successful connection build"
            );
        }
        self.spawn_connection_watcher(conn);
        Ok(())
    }

    fn record_build_failure(self: &Arc<Self>) {
        let (token, failures) = {
            let mut inner = self.inner.lock().expect("host lock poisoned");
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            let Some(health) = &self.health else { return };
            if inner.state != HostState::Active
                || inner.consecutive_failures < health.config.failure_threshold
            {
                return;
            }
            inner.state = HostState::Unhealthy;
            let token = CancellationToken::new();
            inner.probe = Some(token.clone());
            (token, inner.consecutive_failures)
        };
        warn!(
            lb = %self.target,
            address = %self.address,
            failures,
            "Host exceeded the connect failure threshold; quarantining"
        );
        self.spawn_probe(token);
    }

    /// Background revival loop; at most one per host.
    fn spawn_probe(self: &Arc<Self>, token: CancellationToken) {
        let host = Arc::downgrade(self);
        let health = self
            .health
            .clone()
            .expect("probe scheduled without health config");
        tokio::spawn(async move {
            loop {
                let delay = time::jittered(health.config.probe_interval, health.config.probe_jitter);
                let sleep = health.time.sleep(delay);
                tokio::select! {
                    _ = token.cancelled() => return,
                    () = sleep => {}
                }
                let Some(host) = host.upgrade() else { return };
                // Cancellation is observed between attempts; an attempt
                // that already started is allowed to finish.
                if token.is_cancelled() {
                    return;
                }
                if host.probe_once().await {
                    return;
                }
            }
        });
    }

    /// One probe attempt. Returns `true` when the loop should stop.
    async fn probe_once(self: &Arc<Self>) -> bool {
        debug!(lb = %self.target, address = %self.address, "Probing unhealthy host");
        match self
            .factory
            .connect(&self.address, &RequestContext::new())
            .await
        {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let adopted = {
                    let mut inner = self.inner.lock().expect("host lock poisoned");
                    if inner.state == HostState::Unhealthy {
                        inner.state = HostState::Active;
                        inner.consecutive_failures = 0;
                        inner.probe = None;
                        inner.connections.push(Arc::clone(&conn));
                        true
                    } else {
                        false
                    }
                };
                if adopted {
                    self.stats.record_connection();
                    info!(lb = %self.target, address = %self.address, "Probe succeeded; host active again");
                    self.spawn_connection_watcher(&conn);
                } else {
                    // The host moved on while the probe was connecting.
                    tokio::spawn(conn.close(true));
                }
                true
            }
            Err(error) => {
                {
                    let mut inner = self.inner.lock().expect("host lock poisoned");
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                }
                debug!(
                    lb = %self.target,
                    address = %self.address,
                    error = %error,
                    "Probe connect failed; rescheduling"
                );
                false
            }
        }
    }

    /// Transition `Expired`/`Unhealthy` back to `Active`; cancels any
    /// probe. Returns `false` iff the host is `Closed`.
    pub(crate) fn mark_active_if_not_closed(&self) -> bool {
        let mut inner = self.inner.lock().expect("host lock poisoned");
        match inner.state {
            HostState::Closed => false,
            HostState::Active => true,
            HostState::Expired | HostState::Unhealthy => {
                inner.state = HostState::Active;
                inner.consecutive_failures = 0;
                if let Some(probe) = inner.probe.take() {
                    probe.cancel();
                }
                true
            }
        }
    }

    /// Begin retiring the host. Returns `true` iff the host self-closed
    /// because nothing remains to drain, in which case the caller drops it
    /// from the host list.
    pub(crate) fn mark_expired(self: &Arc<Self>) -> bool {
        let closing = {
            let mut inner = self.inner.lock().expect("host lock poisoned");
            match inner.state {
                HostState::Closed => return true,
                HostState::Expired => return false,
                HostState::Active if !inner.connections.is_empty() => {
                    inner.state = HostState::Expired;
                    debug!(
                        lb = %self.target,
                        address = %self.address,
                        pool = inner.connections.len(),
                        "Host expired; draining pool"
                    );
                    return false;
                }
                // Active with an empty pool, or Unhealthy: nothing worth
                // draining.
                _ => {
                    inner.state = HostState::Closed;
                    if let Some(probe) = inner.probe.take() {
                        probe.cancel();
                    }
                    std::mem::take(&mut inner.connections)
                }
            }
        };
        for conn in closing {
            tokio::spawn(conn.close(true));
        }
        self.fire_drained_hook();
        true
    }

    /// Terminal close; cancels the probe and schedules a graceful close of
    /// every pooled connection.
    pub(crate) fn mark_closed(self: &Arc<Self>) {
        let connections = self.begin_close();
        for conn in connections {
            tokio::spawn(conn.close(true));
        }
        self.fire_drained_hook();
    }

    /// Close the host and wait for every pooled connection to close.
    pub(crate) async fn close(self: &Arc<Self>, graceful: bool) {
        let connections = self.begin_close();
        self.fire_drained_hook();
        join_all(connections.iter().map(|conn| conn.close(graceful))).await;
    }

    fn begin_close(&self) -> Vec<Arc<C>> {
        let mut inner = self.inner.lock().expect("host lock poisoned");
        if inner.state != HostState::Closed {
            inner.state = HostState::Closed;
            if let Some(probe) = inner.probe.take() {
                probe.cancel();
            }
        }
        std::mem::take(&mut inner.connections)
    }

    fn spawn_connection_watcher(self: &Arc<Self>, conn: &Arc<C>) {
        let host = Arc::downgrade(self);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            conn.closed().await;
            if let Some(host) = host.upgrade() {
                host.on_connection_closed(&conn);
            }
        });
    }

    fn on_connection_closed(self: &Arc<Self>, conn: &Arc<C>) {
        let drained = {
            let mut inner = self.inner.lock().expect("host lock poisoned");
            inner.connections.retain(|pooled| !Arc::ptr_eq(pooled, conn));
            if inner.state == HostState::Expired && inner.connections.is_empty() {
                inner.state = HostState::Closed;
                true
            } else {
                false
            }
        };
        if drained {
            debug!(
                lb = %self.target,
                address = %self.address,
                "Expired host drained its last connection; closing"
            );
            self.fire_drained_hook();
        }
    }

    fn fire_drained_hook(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("host lock poisoned");
            if inner.drained_hook_fired {
                return;
            }
            inner.drained_hook_fired = true;
        }
        (self.on_drained)(self);
    }
}

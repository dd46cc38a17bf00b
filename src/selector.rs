//! Host selection.
//!
//! The selector maps a request to a host from an immutable snapshot of the
//! host list. Selection state is a single rotating counter; everything
//! else lives on the hosts themselves.

use crate::connection::{ConnectionFilter, LoadBalancedConnection, RequestContext};
use crate::discovery::ResolvedAddress;
use crate::error::{LoadBalancerError, LoadBalancerResult};
use crate::host::{Host, HostState};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Trait for host selection strategies.
pub trait Selector<A, C>: Send + Sync {
    /// Select a connection from the given host-list snapshot.
    fn select<'a>(
        &'a self,
        hosts: &'a [Arc<Host<A, C>>],
        filter: &'a ConnectionFilter<C>,
        context: &'a RequestContext,
        force_new: bool,
    ) -> Pin<Box<dyn Future<Output = LoadBalancerResult<Arc<C>>> + Send + 'a>>;

    /// Get the strategy name.
    fn name(&self) -> &'static str;
}

/// Round-robin selection with a health bias.
///
/// A monotonically increasing counter modulo the snapshot length picks the
/// starting index; one full rotation visits every host, skipping those not
/// in a selectable state. Reuse is attempted before a new build. With
/// `force_new`, a failed build on the chosen host is surfaced instead of
/// silently substituting a different backend.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicU64,
}

impl RoundRobinSelector {
    /// Create a new round-robin selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A, C> Selector<A, C> for RoundRobinSelector
where
    A: ResolvedAddress,
    C: LoadBalancedConnection,
{
    fn select<'a>(
        &'a self,
        hosts: &'a [Arc<Host<A, C>>],
        filter: &'a ConnectionFilter<C>,
        context: &'a RequestContext,
        force_new: bool,
    ) -> Pin<Box<dyn Future<Output = LoadBalancerResult<Arc<C>>> + Send + 'a>> {
        Box::pin(async move {
            if hosts.is_empty() {
                return Err(LoadBalancerError::NoHostsAvailable);
            }

            let start = (self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len() as u64) as usize;
            let mut last_build_error = None;

            for offset in 0..hosts.len() {
                let host = &hosts[(start + offset) % hosts.len()];
                let state = host.state();
                let eligible = if force_new {
                    // Expired hosts are reuse-only; a forced build cannot
                    // land on one.
                    state == HostState::Active
                } else {
                    state.is_selectable()
                };
                if !eligible {
                    trace!(address = %host.address(), state = ?state, "Skipping host");
                    continue;
                }

                match host.select_or_build(filter, context, force_new).await {
                    Ok(conn) => return Ok(conn),
                    Err(error @ LoadBalancerError::ConnectionFailed { .. }) => {
                        if force_new {
                            // The caller asked for a guaranteed fresh
                            // connection on this host; no fan-out.
                            return Err(error);
                        }
                        last_build_error = Some(error);
                    }
                    // The host raced into a non-selectable state between
                    // the snapshot read and the call; try the next one.
                    Err(_) => {}
                }
            }

            match last_build_error {
                Some(error) => Err(error),
                None => Err(LoadBalancerError::NoActiveHost),
            }
        })
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

//! Service-discovery batch reconciliation.
//!
//! Applies one batch of discovery events to the current host list,
//! producing the next list plus a readiness-transition flag. Runs only on
//! the balancer's single-writer executor; the returned list becomes the
//! next published snapshot.

use crate::connection::LoadBalancedConnection;
use crate::discovery::{DiscoveryEvent, EventStatus, ResolvedAddress};
use crate::host::Host;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Apply `batch` to `old`, returning the next host list and whether a
/// readiness event should be published because hosts were added.
///
/// `make_host` constructs a fresh host for a newly available address.
pub(crate) fn apply_batch<A, C, F>(
    old: &[Arc<Host<A, C>>],
    batch: &[DiscoveryEvent<A>],
    mut make_host: F,
) -> (Vec<Arc<Host<A, C>>>, bool)
where
    A: ResolvedAddress,
    C: LoadBalancedConnection,
    F: FnMut(&A) -> Arc<Host<A, C>>,
{
    // Map addresses to events first so diffing stays linear. Duplicate
    // addresses within one batch: the last event wins.
    let mut events: HashMap<&A, EventStatus> = HashMap::with_capacity(batch.len());
    for event in batch {
        if let Some(previous) = events.insert(&event.address, event.status) {
            warn!(
                address = %event.address,
                previous = ?previous,
                status = ?event.status,
                "Multiple discovery events for one address in a batch; last wins"
            );
        }
    }

    let mut next = Vec::with_capacity(old.len() + batch.len());
    let mut ready_transition = false;

    // Transfer existing hosts according to their event, if any.
    for host in old {
        match events.remove(host.address()) {
            None => next.push(Arc::clone(host)),
            Some(EventStatus::Available) => {
                if host.mark_active_if_not_closed() {
                    next.push(Arc::clone(host));
                } else {
                    // The old host is already closed and drains
                    // separately; the address gets a fresh host.
                    next.push(make_host(host.address()));
                }
            }
            Some(EventStatus::Expired) => {
                if !host.mark_expired() {
                    next.push(Arc::clone(host));
                }
            }
            Some(EventStatus::Unavailable) => {
                debug!(address = %host.address(), "Host unavailable; closing");
                host.mark_closed();
            }
        }
    }

    // Events without an existing host: only newly available addresses
    // matter, appended in batch order.
    for event in batch {
        if let Some(status) = events.remove(&event.address) {
            if status == EventStatus::Available {
                next.push(make_host(&event.address));
                ready_transition = true;
            }
        }
    }

    (next, ready_transition)
}

/// Whether every event in the batch is `Available`. An empty batch does
/// not qualify.
pub(crate) fn only_available<A>(batch: &[DiscoveryEvent<A>]) -> bool {
    !batch.is_empty()
        && batch
            .iter()
            .all(|event| event.status == EventStatus::Available)
}

/// Whether `address` appears anywhere in the batch.
pub(crate) fn in_batch<A: Eq>(address: &A, batch: &[DiscoveryEvent<A>]) -> bool {
    batch.iter().any(|event| event.address == *address)
}

//! Service discovery contract.
//!
//! The discoverer is an injected collaborator producing an asynchronous
//! stream of event batches. Each batch describes which backend addresses
//! became available, expired, or unavailable. The stream may complete or
//! error, and the balancer may resubscribe it at any time.

use crate::error::BoxError;
use futures_util::stream::BoxStream;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Bounds required of a resolved backend address.
///
/// Blanket-implemented; `SocketAddr`, `String`, and `&'static str` all
/// qualify.
pub trait ResolvedAddress: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static {}

impl<T> ResolvedAddress for T where T: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static {}

/// Lifecycle status carried by a service-discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// The address is available for new connections.
    Available,
    /// The address is being retired: existing connections may be used
    /// until they close, but the host should wind down.
    Expired,
    /// The address is gone; its host must be closed.
    Unavailable,
}

/// A single service-discovery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent<A> {
    /// Resolved backend address.
    pub address: A,
    /// Lifecycle status for the address.
    pub status: EventStatus,
}

impl<A> DiscoveryEvent<A> {
    /// An `Available` event for `address`.
    pub fn available(address: A) -> Self {
        Self {
            address,
            status: EventStatus::Available,
        }
    }

    /// An `Expired` event for `address`.
    pub fn expired(address: A) -> Self {
        Self {
            address,
            status: EventStatus::Expired,
        }
    }

    /// An `Unavailable` event for `address`.
    pub fn unavailable(address: A) -> Self {
        Self {
            address,
            status: EventStatus::Unavailable,
        }
    }
}

/// A batch of service-discovery events, applied atomically to the host
/// list.
pub type EventBatch<A> = Vec<DiscoveryEvent<A>>;

/// Produces the stream of service-discovery event batches.
pub trait ServiceDiscoverer<A>: Send + Sync + 'static {
    /// Open a new subscription.
    ///
    /// Every call establishes an independent stream; the balancer calls
    /// this once at startup and again on each resubscribe, after
    /// cancelling the previous subscription.
    fn subscribe(&self) -> BoxStream<'static, Result<EventBatch<A>, BoxError>>;
}

//! Connection and connection-factory contracts.
//!
//! The transport is an injected collaborator: the balancer never opens
//! sockets itself. It needs three things from a connection (an atomic
//! one-shot reservation, a close signal, and a close operation) and one
//! thing from the factory: an async connect.

use crate::error::BoxError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;

/// Predicate applied to candidate reused connections. A freshly built
/// connection is assumed to satisfy the caller's intent and is not
/// filtered.
pub type ConnectionFilter<C> = dyn Fn(&C) -> bool + Send + Sync;

/// A connection that can be managed by the load balancer.
pub trait LoadBalancedConnection: Send + Sync + 'static {
    /// Atomically reserve this connection for a single request.
    ///
    /// Returns `false` if the connection is already reserved or no longer
    /// usable. A successful reservation must eventually be released or the
    /// connection closed.
    fn try_reserve(&self) -> bool;

    /// A future that resolves once the connection has closed. Used by the
    /// balancer to prune the pool and to drain expired hosts.
    fn closed(&self) -> BoxFuture<'static, ()>;

    /// Close the connection. A graceful close allows in-flight work to
    /// finish; a non-graceful close tears the transport down immediately.
    fn close(&self, graceful: bool) -> BoxFuture<'static, ()>;
}

/// Builds connections to resolved addresses.
#[async_trait]
pub trait ConnectionFactory<A, C>: Send + Sync + 'static {
    /// Establish a new connection to `address`.
    ///
    /// Timing out a connect attempt is the factory's responsibility; the
    /// balancer imposes no timeout of its own.
    async fn connect(&self, address: &A, context: &RequestContext) -> Result<C, BoxError>;

    /// Close the factory, releasing any resources it holds. Invoked as the
    /// final step of balancer shutdown.
    async fn close(&self, graceful: bool) {
        let _ = graceful;
    }
}

/// Opaque per-request context threaded through to the connection factory.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    values: HashMap<String, String>,
}

impl RequestContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

//! # coxswain
//!
//! A client-side load balancer. It consumes a stream of service-discovery
//! event batches, maintains a per-host pool of reusable connections, and
//! answers one question per request: which connection should serve it.
//!
//! ## Features
//!
//! - **Round-robin selection** with connection reuse and a bounded
//!   linear scan over each host's pool
//! - **Health checking**: hosts are quarantined after consecutive connect
//!   failures and revived by background probes with jittered backoff
//! - **Service-discovery reconciliation**: available/expired/unavailable
//!   event batches applied atomically to an immutable host-list snapshot
//! - **Resubscribe policy**: the discovery stream is re-established when
//!   every host is unhealthy
//! - **Readiness events** with replay of the latest state to late
//!   subscribers
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐ batches ┌────────────────┐ next list ┌───────────┐
//!  │  Service     │────────▶│  Reconciler    │──────────▶│ Host list │
//!  │  Discoverer  │         │ (single writer)│           │ snapshot  │
//!  └──────────────┘         └────────────────┘           └─────┬─────┘
//!                                                              │
//!  ┌──────────────┐ select  ┌────────────────┐    pick         │
//!  │   Request    │────────▶│   Selector     │◀────────────────┘
//!  └──────────────┘         │ (round-robin)  │
//!                           └───────┬────────┘
//!                                   │ reuse or build
//!                           ┌───────▼────────┐
//!                           │     Host       │──▶ connection factory
//!                           │ pool + health  │
//!                           └────────────────┘
//! ```
//!
//! The transport, the connection factory, and the service discoverer are
//! injected collaborators; see [`connection`] and [`discovery`].

pub mod balancer;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod host;
pub mod readiness;
mod reconcile;
pub mod selector;
mod serial;
pub mod time;

pub use balancer::{HostSnapshot, LoadBalancer, LoadBalancerBuilder, LoadBalancerStats};
pub use config::{HealthCheckConfig, LoadBalancerConfig};
pub use connection::{ConnectionFactory, ConnectionFilter, LoadBalancedConnection, RequestContext};
pub use discovery::{DiscoveryEvent, EventBatch, EventStatus, ResolvedAddress, ServiceDiscoverer};
pub use error::{BoxError, LoadBalancerError, LoadBalancerResult};
pub use host::{Host, HostState};
pub use readiness::{EventStream, ReadyEvent};
pub use selector::{RoundRobinSelector, Selector};
pub use time::{TimeSource, TokioClock};

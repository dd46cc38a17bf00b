//! Load balancer error types.

use thiserror::Error;

/// Boxed error type produced by injected collaborators (connection
/// factories, service discoverers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the load balancer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadBalancerError {
    /// The load balancer has been closed.
    #[error("load balancer for '{0}' has closed")]
    Closed(String),

    /// Service discovery has emitted events, but the current host list is
    /// empty.
    #[error("no hosts are available to connect")]
    NoHostsAvailable,

    /// The host list is non-empty, but no host is in a selectable state.
    #[error("no active host to connect")]
    NoActiveHost,

    /// A single host was not in a connectable state.
    #[error("host {0} is not in a connectable state")]
    HostNotActive(String),

    /// The connection factory failed to build a connection.
    #[error("connection to {address} failed: {message}")]
    ConnectionFailed {
        /// Address of the host the build was attempted against.
        address: String,
        /// Factory error message.
        message: String,
    },

    /// The service discovery stream terminated with an error.
    #[error("service discovery stream failed: {0}")]
    Discovery(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl LoadBalancerError {
    pub(crate) fn connection_failed(address: impl ToString, error: &BoxError) -> Self {
        Self::ConnectionFailed {
            address: address.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type for load balancer operations.
pub type LoadBalancerResult<T> = Result<T, LoadBalancerError>;

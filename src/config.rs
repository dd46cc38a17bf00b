//! Load balancer configuration types.

use crate::error::{LoadBalancerError, LoadBalancerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// How many pooled connections are scanned per host when looking for an
    /// idle connection to reuse. Beyond this bound a new connection is
    /// built even though older pool entries may be idle.
    pub linear_search_space: usize,

    /// Health checking configuration. `None` disables health checking
    /// entirely: no host is ever marked unhealthy, probes are never
    /// scheduled, and resubscribe never fires.
    pub health_check: Option<HealthCheckConfig>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            linear_search_space: default_linear_search_space(),
            health_check: Some(HealthCheckConfig::default()),
        }
    }
}

impl LoadBalancerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> LoadBalancerResult<()> {
        if self.linear_search_space == 0 {
            return Err(LoadBalancerError::ConfigError(
                "linear_search_space must be at least 1".to_string(),
            ));
        }
        if let Some(health) = &self.health_check {
            health.validate()?;
        }
        Ok(())
    }
}

/// Health check configuration.
///
/// Controls when a host is quarantined after consecutive connect failures,
/// how background re-probes are scheduled, and the window after which the
/// service-discovery stream is resubscribed when every host is unhealthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Number of consecutive connect failures before a host is marked
    /// unhealthy.
    pub failure_threshold: u32,

    /// Base interval between background probes of an unhealthy host.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Uniform random jitter added to each probe interval.
    #[serde(with = "humantime_serde")]
    pub probe_jitter: Duration,

    /// Lower bound of the resubscribe window.
    #[serde(with = "humantime_serde")]
    pub resubscribe_lower: Duration,

    /// Upper bound of the resubscribe window.
    #[serde(with = "humantime_serde")]
    pub resubscribe_upper: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            probe_interval: Duration::from_secs(5),
            probe_jitter: Duration::from_secs(3),
            resubscribe_lower: Duration::from_secs(10),
            resubscribe_upper: Duration::from_secs(20),
        }
    }
}

impl HealthCheckConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> LoadBalancerResult<()> {
        if self.failure_threshold == 0 {
            return Err(LoadBalancerError::ConfigError(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.resubscribe_upper < self.resubscribe_lower {
            return Err(LoadBalancerError::ConfigError(format!(
                "resubscribe_upper ({:?}) must not be below resubscribe_lower ({:?})",
                self.resubscribe_upper, self.resubscribe_lower
            )));
        }
        Ok(())
    }
}

fn default_linear_search_space() -> usize {
    16
}

fn default_failure_threshold() -> u32 {
    5
}

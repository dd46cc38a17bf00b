//! Injected time source and jitter helpers.

use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A monotonic time source with the ability to sleep.
///
/// Injected so that probe scheduling and the resubscribe window can be
/// driven by a test clock. The default implementation is [`TokioClock`],
/// which defers to `tokio::time` and therefore honors a paused test
/// runtime.
pub trait TimeSource: Send + Sync + 'static {
    /// Monotonic time elapsed since the source was created.
    fn now(&self) -> Duration;

    /// Sleep for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

/// The default time source, backed by the tokio clock.
#[derive(Debug)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
}

impl TokioClock {
    /// Create a clock whose epoch is the moment of creation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// `base + uniform(0, jitter)`, sampled from the thread-local RNG.
pub(crate) fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra = rand::rng().random_range(0..=jitter.as_nanos() as u64);
    base + Duration::from_nanos(extra)
}

/// `uniform(lower, upper)`, sampled from the thread-local RNG. Returns
/// `lower` when the bounds coincide.
pub(crate) fn uniform_between(lower: Duration, upper: Duration) -> Duration {
    if lower >= upper {
        return lower;
    }
    let nanos = rand::rng().random_range(lower.as_nanos() as u64..upper.as_nanos() as u64);
    Duration::from_nanos(nanos)
}

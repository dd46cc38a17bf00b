//! Readiness event stream.
//!
//! The balancer publishes a readiness event on every empty/non-empty
//! host-list transition. The stream replays its most recent event to late
//! subscribers, backed by a watch channel whose latest value is the cached
//! replay.

use crate::error::LoadBalancerError;
use tokio::sync::watch;

/// Readiness of the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyEvent {
    /// At least one host is known.
    Ready,
    /// The host list is empty.
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamState {
    /// No event has been published yet.
    Pending,
    /// The most recent readiness event.
    Event(ReadyEvent),
    /// The stream terminated with a discovery error.
    Failed(String),
    /// The stream completed normally (balancer closed, or the discoverer
    /// finished with health checking disabled).
    Completed,
}

/// Publisher half of the readiness stream.
pub(crate) struct ReadinessSender {
    tx: watch::Sender<StreamState>,
}

impl ReadinessSender {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(StreamState::Pending);
        Self { tx }
    }

    /// Publish a readiness event. Duplicates of the current event are
    /// suppressed so subscribers only observe transitions. Ignored once the
    /// stream has terminated.
    pub(crate) fn emit(&self, event: ReadyEvent) {
        self.tx.send_if_modified(|state| match state {
            StreamState::Failed(_) | StreamState::Completed => false,
            StreamState::Event(current) if *current == event => false,
            _ => {
                *state = StreamState::Event(event);
                true
            }
        });
    }

    /// Terminate the stream with a discovery error.
    pub(crate) fn fail(&self, message: String) {
        self.tx.send_if_modified(|state| match state {
            StreamState::Failed(_) | StreamState::Completed => false,
            _ => {
                *state = StreamState::Failed(message);
                true
            }
        });
    }

    /// Complete the stream.
    pub(crate) fn complete(&self) {
        self.tx.send_if_modified(|state| match state {
            StreamState::Failed(_) | StreamState::Completed => false,
            _ => {
                *state = StreamState::Completed;
                true
            }
        });
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            replayed: false,
            terminated: false,
        }
    }
}

/// Subscriber half of the readiness stream.
///
/// The first call to [`next`](Self::next) replays the most recent event if
/// one was published before subscribing; subsequent calls yield each
/// transition as it happens.
pub struct EventStream {
    rx: watch::Receiver<StreamState>,
    replayed: bool,
    terminated: bool,
}

impl EventStream {
    /// Wait for the next readiness event.
    ///
    /// Returns `None` once the stream has completed, and `Some(Err(_))`
    /// exactly once if the discovery stream failed terminally.
    pub async fn next(&mut self) -> Option<Result<ReadyEvent, LoadBalancerError>> {
        if self.terminated {
            return None;
        }
        if !self.replayed {
            self.replayed = true;
            let current = self.rx.borrow_and_update().clone();
            match current {
                StreamState::Pending => {}
                StreamState::Event(event) => return Some(Ok(event)),
                StreamState::Failed(message) => {
                    self.terminated = true;
                    return Some(Err(LoadBalancerError::Discovery(message)));
                }
                StreamState::Completed => {
                    self.terminated = true;
                    return None;
                }
            }
        }
        loop {
            if self.rx.changed().await.is_err() {
                self.terminated = true;
                return None;
            }
            let current = self.rx.borrow_and_update().clone();
            match current {
                StreamState::Pending => continue,
                StreamState::Event(event) => return Some(Ok(event)),
                StreamState::Failed(message) => {
                    self.terminated = true;
                    return Some(Err(LoadBalancerError::Discovery(message)));
                }
                StreamState::Completed => {
                    self.terminated = true;
                    return None;
                }
            }
        }
    }
}

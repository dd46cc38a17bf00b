//! Single-writer executor.
//!
//! All host-list mutations are funneled through one FIFO queue drained by a
//! single task, so updates are totally ordered without holding a lock
//! across them. A job that enqueues another job (for example a host-drain
//! callback) never deadlocks or reenters: the new job simply lands at the
//! tail of the queue.

use tokio::sync::mpsc;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO queue of jobs executed one at a time, in submission order.
#[derive(Clone)]
pub(crate) struct SerialExecutor {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    /// Create the executor and spawn its drain task. Must be called from
    /// within a tokio runtime.
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            trace!("serial executor drained and shut down");
        });
        Self { tx }
    }

    /// Enqueue a job. Jobs run in submission order; no two jobs run
    /// concurrently. Silently dropped if the drain task has stopped, which
    /// only happens when every handle is gone.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }
}

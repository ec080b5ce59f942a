//! Per-device asynchronous work queue
//!
//! Fragments are queued on a bounded channel. A dispatcher task spawns
//! each job as its own task, so fragments of one request run in parallel
//! and complete on arbitrary worker threads.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// A queued unit of work
pub type Job = BoxFuture<'static, ()>;

/// Submission failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("work queue {0} is closed")]
    Closed(String),
}

/// Bounded work queue drained by a dispatcher task
#[derive(Debug)]
pub struct WorkQueue {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
}

impl WorkQueue {
    /// Create a queue and start its dispatcher
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new(name: impl Into<String>, depth: usize) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<Job>(depth.max(1));

        let dispatcher_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                tokio::spawn(job);
            }
            debug!("Work queue {} dispatcher exiting", dispatcher_name);
        });

        Self {
            name,
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Queue name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job, waiting for space if the queue is full
    pub async fn submit(&self, job: Job) -> Result<(), WorkQueueError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| WorkQueueError::Closed(self.name.clone()))?;
        tx.send(job)
            .await
            .map_err(|_| WorkQueueError::Closed(self.name.clone()))
    }

    /// Refuse further submissions; queued jobs still run
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("Work queue {} closed", self.name);
        }
    }

    /// Whether the queue still accepts jobs
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.tx.lock().is_some()
    }
}

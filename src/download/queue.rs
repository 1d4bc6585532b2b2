//! Bounded FIFO of admitted download jobs.
//!
//! Admission never blocks: a full queue is reported back to the caller, who
//! tells the user to try later.

use super::Job;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Queue admission errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue is at capacity; the job is handed back
    #[error("download queue is full")]
    Full(Box<Job>),
    /// All consumers are gone
    #[error("download queue is closed")]
    Closed(Box<Job>),
}

/// Bounded multi-consumer job queue
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    capacity: usize,
}

impl JobQueue {
    /// Creates a queue holding at most `capacity` jobs
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity,
        }
    }

    /// Appends a job without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] when at capacity.
    pub fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => QueueError::Full(Box::new(job)),
            mpsc::error::TrySendError::Closed(job) => QueueError::Closed(Box::new(job)),
        })
    }

    /// Waits for the next job in FIFO order.
    ///
    /// Consumers take turns on the receiver; only one waits on it at a time.
    pub async fn dequeue(&self) -> Option<Job> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Jobs currently waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Whether no job is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

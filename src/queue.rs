//! Bounded FIFO of work items with a completion barrier.
//!
//! Every `put` bumps a pending counter; the counter only goes down when the
//! [`Delivery`] handed out by `get` is acknowledged. `join` waits for zero.

use crate::model::WorkItem;
use async_channel::{Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is closed")]
    Closed,
}

/// What travels through the queue. `Stop` is the per-worker shutdown sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Work(WorkItem),
    Stop,
}

#[derive(Clone)]
pub struct WorkQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    pending: Arc<watch::Sender<usize>>,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("queued", &self.rx.len())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        let (pending, _) = watch::channel(0usize);
        Self {
            tx,
            rx,
            pending: Arc::new(pending),
        }
    }

    /// Enqueue a job, waiting for room when the queue is full.
    pub async fn put(&self, job: Job) -> Result<(), QueueError> {
        // Count first so a concurrent join() can never observe a false zero.
        let reservation = Reservation::take(&self.pending);
        self.tx.send(job).await.map_err(|_| QueueError::Closed)?;
        reservation.keep();
        Ok(())
    }

    /// Dequeue the oldest job, waiting while the queue is empty.
    pub async fn get(&self) -> Result<Delivery, QueueError> {
        let job = self.rx.recv().await.map_err(|_| QueueError::Closed)?;
        Ok(Delivery::new(job, self.pending.clone()))
    }

    /// Wait until every job ever enqueued has been acknowledged.
    pub async fn join(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so the only outcome is Ok.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Jobs enqueued but not yet acknowledged.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Jobs sitting in the channel, not yet handed to a worker.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Acknowledge whatever is still queued without running it. Used after all
    /// workers have exited so an orphaned sentinel cannot hold `join` open.
    pub fn discard_remaining(&self) -> Vec<Job> {
        let mut discarded = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            Delivery::new(job.clone(), self.pending.clone()).task_done();
            discarded.push(job);
        }
        discarded
    }

    /// Refuse further puts. Jobs already queued can still be taken.
    pub fn close(&self) {
        self.tx.close();
    }
}

fn release(pending: &watch::Sender<usize>) {
    pending.send_modify(|n| *n = n.saturating_sub(1));
}

/// Pending-count increment that is rolled back unless the send completes
/// (a failed or cancelled `put`).
struct Reservation<'a> {
    pending: Option<&'a watch::Sender<usize>>,
}

impl<'a> Reservation<'a> {
    fn take(pending: &'a watch::Sender<usize>) -> Self {
        pending.send_modify(|n| *n += 1);
        Self {
            pending: Some(pending),
        }
    }

    fn keep(mut self) {
        self.pending = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            release(pending);
        }
    }
}

/// A dequeued job plus the obligation to acknowledge it.
///
/// Dropping an unacknowledged delivery acknowledges it, so an early return or a
/// panic inside a worker still releases the barrier.
pub struct Delivery {
    job: Job,
    ack: Option<Arc<watch::Sender<usize>>>,
}

impl Delivery {
    fn new(job: Job, pending: Arc<watch::Sender<usize>>) -> Self {
        Self {
            job,
            ack: Some(pending),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn task_done(mut self) {
        self.acknowledge();
    }

    fn acknowledge(&mut self) {
        if let Some(pending) = self.ack.take() {
            release(&pending);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.acknowledge();
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("job", &self.job)
            .field("acknowledged", &self.ack.is_none())
            .finish()
    }
}

//! Shared FIFO between the inbound handlers (producers) and the Nodes
//! (consumers).
//!
//! Each job is handed to exactly one consumer. Consumers wait on a
//! [`Notify`] with a deadline instead of sleep-polling, so they wake as soon
//! as work arrives and still get back to check the termination flag.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::job::Job;

/// Unbounded multi-producer, multi-consumer job queue.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panic while holding the lock leaves the deque itself intact, so
    /// other consumers keep going with it.
    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job and wake one waiting consumer.
    pub fn push(&self, job: Job) {
        self.jobs().push_back(job);
        self.available.notify_one();
    }

    /// Put back a job that was taken but never dispatched, ahead of
    /// everything else.
    pub fn push_front(&self, job: Job) {
        self.jobs().push_front(job);
        self.available.notify_one();
    }

    /// Take the oldest job without waiting.
    pub fn try_pop(&self) -> Option<Job> {
        self.jobs().pop_front()
    }

    /// Take the oldest job, waiting up to `wait` for one to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Job> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_pop() {
                return Some(job);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

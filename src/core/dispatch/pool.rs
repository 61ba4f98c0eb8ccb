// src/core/dispatch/pool.rs

//! The bounded worker pool that runs inbound queries.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::io::Cursor;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, error};

/// A unit of work submitted to a pool.
pub type Job = BoxFuture<'static, ()>;

/// Accepts jobs for execution, or refuses them when saturated.
#[async_trait]
pub trait TaskPool: Send + Sync {
    /// Queues `job`, waiting at most `queue_timeout` for room.
    ///
    /// `priority` (0..=1) controls how far jobs sharing `key` may spread
    /// across workers: 0 pins them to one queue, 1 lets them use every queue.
    /// Returns `false` if the job was dropped without running.
    async fn push_task(&self, job: Job, queue_timeout: Duration, priority: f64, key: &str) -> bool;
}

/// A pool of workers, each draining its own bounded queue in order.
#[derive(Debug)]
pub struct PartitionedPool {
    queues: Vec<mpsc::Sender<Job>>,
}

impl PartitionedPool {
    /// Spawns `workers` worker tasks on the current runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let queues = (0..workers)
            .map(|index| {
                let (tx, rx) = mpsc::channel(queue_capacity);
                tokio::spawn(run_worker(index, rx));
                tx
            })
            .collect();
        Self { queues }
    }

    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// The queues a key may use, starting at its home queue.
    pub fn candidate_queues(&self, key: &str, priority: f64) -> Vec<usize> {
        candidate_queues(self.queues.len(), key, priority)
    }
}

/// Computes the queue indices open to `key`.
pub fn candidate_queues(workers: usize, key: &str, priority: f64) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }
    let home = key_hash(key) as usize % workers;
    let factor = if priority.is_finite() {
        priority.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let spread = 1 + (factor * (workers - 1) as f64).round() as usize;
    (0..spread).map(|offset| (home + offset) % workers).collect()
}

fn key_hash(key: &str) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(key.as_bytes()), 0).unwrap_or_default()
}

async fn run_worker(index: usize, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!("A task on worker {} panicked.", index);
        }
    }
    debug!("Worker {} stopped: queue closed.", index);
}

#[async_trait]
impl TaskPool for PartitionedPool {
    async fn push_task(&self, job: Job, queue_timeout: Duration, priority: f64, key: &str) -> bool {
        let candidates = self.candidate_queues(key, priority);
        // Prefer the candidate with the most free slots; ties go to the home queue.
        let Some(target) = candidates
            .iter()
            .copied()
            .rev()
            .max_by_key(|&i| self.queues[i].capacity())
        else {
            return false;
        };
        let queue = &self.queues[target];

        let job = match queue.try_send(job) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(job)) => job,
        };
        match queue.send_timeout(job, queue_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                debug!("Queue {} stayed full for {:?}", target, queue_timeout);
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }
}

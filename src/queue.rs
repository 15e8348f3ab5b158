// src/queue.rs - Per-device job backlog with stable priority insertion
use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::job::Job;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("job {0} is already queued")]
    Duplicate(Uuid),
}

/// Ordered backlog of jobs for one device. The handle is cheap to clone;
/// all clones share the same backing sequence, so control-surface code can
/// inspect or prune the queue while a fabricator consumes it.
///
/// Priority convention: a numerically **larger** priority is scheduled
/// earlier. Jobs of equal priority keep their submission order.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    inner: Arc<RwLock<VecDeque<Job>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `job` ahead of every queued job whose priority is strictly
    /// lower than `priority`. Rejects a job whose id is already queued.
    pub async fn add_to_front(&self, job: Job, priority: i32) -> Result<(), QueueError> {
        let mut queue = self.inner.write().await;
        if queue.iter().any(|queued| queued.id == job.id) {
            return Err(QueueError::Duplicate(job.id));
        }
        let at = queue
            .iter()
            .position(|queued| queued.priority < priority)
            .unwrap_or(queue.len());
        tracing::debug!(
            "job {} queued for {} at slot {} (priority {})",
            job.id,
            job.device_name,
            at,
            priority
        );
        queue.insert(at, job);
        Ok(())
    }

    /// `add_to_front` using the priority recorded on the job itself.
    pub async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let priority = job.priority;
        self.add_to_front(job, priority).await
    }

    /// Pop the head of the queue. Never blocks waiting for work.
    pub async fn get_next(&self) -> Result<Job, QueueError> {
        self.inner.write().await.pop_front().ok_or(QueueError::Empty)
    }

    /// Remove a specific job, or the head when `id` is `None`. Returns
    /// whether anything was removed.
    pub async fn remove_job(&self, id: Option<Uuid>) -> bool {
        let mut queue = self.inner.write().await;
        match id {
            None => queue.pop_front().is_some(),
            Some(id) => match queue.iter().position(|job| job.id == id) {
                Some(at) => queue.remove(at).is_some(),
                None => false,
            },
        }
    }

    /// Remove the job at `index`, if in range.
    pub async fn remove_at(&self, index: usize) -> bool {
        self.inner.write().await.remove(index).is_some()
    }

    /// Owned copy of the current queue contents. Mutating the queue after
    /// this call does not affect the returned snapshot.
    pub async fn snapshot(&self) -> Vec<Job> {
        self.inner.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

//! Per-worker prefetch buffer in front of the scheduler.

use std::collections::VecDeque;

use async_trait::async_trait;
use taintcrawl_model::{Task, WorkerId};

use crate::error::Result;
use crate::scheduler::{AffinityHints, Scheduler};

/// Where a [`LocalTaskQueue`] refills from.
#[async_trait]
pub trait SubjectSource: Send + Sync {
    /// Reserve a batch for `worker`. An empty batch means no work.
    async fn reserve(
        &self,
        worker: WorkerId,
        hints: AffinityHints,
    ) -> Result<Vec<Task>>;
}

#[async_trait]
impl SubjectSource for Scheduler {
    async fn reserve(
        &self,
        worker: WorkerId,
        hints: AffinityHints,
    ) -> Result<Vec<Task>> {
        self.next(worker, hints).await
    }
}

/// Double-ended buffer owned by a single worker. Pushing to the front makes
/// the most recently enqueued task the next one out.
#[derive(Debug)]
pub struct LocalTaskQueue<S> {
    worker: WorkerId,
    source: S,
    buffer: VecDeque<Task>,
}

impl<S: SubjectSource> LocalTaskQueue<S> {
    pub fn new(worker: WorkerId, source: S) -> Self {
        Self {
            worker,
            source,
            buffer: VecDeque::new(),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn enqueue(&mut self, task: Task) {
        self.buffer.push_front(task);
    }

    /// Pop the buffered front task, refilling from the source with `hints`
    /// when the buffer is empty. `Ok(None)` means no work.
    pub async fn dequeue(&mut self, hints: AffinityHints) -> Result<Option<Task>> {
        if let Some(task) = self.buffer.pop_front() {
            return Ok(Some(task));
        }
        let batch = self.source.reserve(self.worker, hints).await?;
        self.buffer.extend(batch);
        Ok(self.buffer.pop_front())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Hand back buffered tasks, e.g. to report them before shutting down.
    pub fn drain(&mut self) -> Vec<Task> {
        self.buffer.drain(..).collect()
    }
}

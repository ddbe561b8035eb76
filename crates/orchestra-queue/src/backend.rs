//! Queue backend trait and the in-memory implementation used by tests.

use crate::task::TaskMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A task that exhausted its retry budget or returned skip-retry.
/// Persisted, never re-delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadTask {
    pub task: TaskMessage,
    pub reason: String,
}

/// Transport for task messages. At-least-once: a dequeued task stays in an
/// active set until acked, retried or dead-lettered.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue(&self, task: TaskMessage) -> Result<(), QueueError>;

    /// Pop one task from the named queue, or None when it is empty.
    async fn dequeue(&self, queue: &str) -> Result<Option<TaskMessage>, QueueError>;

    /// Mark a dequeued task as successfully completed.
    async fn ack(&self, task: &TaskMessage) -> Result<(), QueueError>;

    /// Requeue a failed task for re-delivery after `delay`, bumping its
    /// retry counter.
    async fn schedule_retry(&self, task: &TaskMessage, delay: Duration) -> Result<(), QueueError>;

    /// Move a task to the dead-letter store.
    async fn dead_letter(&self, task: &TaskMessage, reason: &str) -> Result<(), QueueError>;

    /// Move scheduled tasks whose delay has elapsed back onto their queues.
    /// Returns how many became deliverable.
    async fn pump_due(&self) -> Result<usize, QueueError>;

    async fn queue_depth(&self, queue: &str) -> Result<usize, QueueError>;

    async fn dead_letters(&self) -> Result<Vec<DeadTask>, QueueError>;
}

#[derive(Default)]
struct MemoryInner {
    queues: HashMap<String, VecDeque<TaskMessage>>,
    scheduled: Vec<(Instant, TaskMessage)>,
    dead: Vec<DeadTask>,
}

/// In-memory backend for tests. No active set: tests drive delivery
/// deterministically and never crash mid-task.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of tasks waiting for their retry delay to elapse.
    pub fn scheduled_count(&self) -> usize {
        self.inner.lock().unwrap().scheduled.len()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, task: TaskMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.entry(task.queue.clone()).or_default().push_back(task);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<TaskMessage>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn ack(&self, _task: &TaskMessage) -> Result<(), QueueError> {
        Ok(())
    }

    async fn schedule_retry(&self, task: &TaskMessage, delay: Duration) -> Result<(), QueueError> {
        let mut bumped = task.clone();
        bumped.retried += 1;
        let mut inner = self.inner.lock().unwrap();
        inner.scheduled.push((Instant::now() + delay, bumped));
        Ok(())
    }

    async fn dead_letter(&self, task: &TaskMessage, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.dead.push(DeadTask {
            task: task.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn pump_due(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        inner.scheduled.retain(|(at, task)| {
            if *at <= now {
                due.push(task.clone());
                false
            } else {
                true
            }
        });
        let count = due.len();
        for task in due {
            inner.queues.entry(task.queue.clone()).or_default().push_back(task);
        }
        Ok(count)
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn dead_letters(&self) -> Result<Vec<DeadTask>, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.dead.clone())
    }
}

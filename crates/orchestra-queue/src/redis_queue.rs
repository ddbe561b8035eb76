//! Redis-backed queue.
//!
//! Layout under the `orchestra` namespace:
//! - `orchestra:queue:{name}`: pending list (LPUSH / RPOPLPUSH)
//! - `orchestra:active`: tasks currently held by a worker
//! - `orchestra:scheduled`: sorted set of retries, score = due epoch secs
//! - `orchestra:dead`: dead-letter list
//!
//! RPOPLPUSH into the active list keeps delivery at-least-once: a worker
//! crash leaves the task visible for recovery instead of losing it.

use crate::backend::{DeadTask, QueueBackend, QueueError};
use crate::task::TaskMessage;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

const NAMESPACE: &str = "orchestra";

pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    /// `addr` is `host:port`; database and password are optional.
    pub fn connect(addr: &str, password: &str, db: i64) -> Result<Self, QueueError> {
        let url = if password.is_empty() {
            format!("redis://{}/{}", addr, db)
        } else {
            format!("redis://:{}@{}/{}", password, addr, db)
        };
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn pending_key(queue: &str) -> String {
        format!("{}:queue:{}", NAMESPACE, queue)
    }

    fn active_key() -> String {
        format!("{}:active", NAMESPACE)
    }

    fn scheduled_key() -> String {
        format!("{}:scheduled", NAMESPACE)
    }

    fn dead_key() -> String {
        format!("{}:dead", NAMESPACE)
    }

    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, task: TaskMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(&task)?;
        let _: () = conn.lpush(Self::pending_key(&task.queue), encoded).await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<TaskMessage>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .rpoplpush(Self::pending_key(queue), Self::active_key())
            .await?;
        match raw {
            Some(encoded) => match serde_json::from_str(&encoded) {
                Ok(task) => Ok(Some(task)),
                Err(e) => {
                    // Undecodable entries cannot be handled; park them in the
                    // dead list rather than wedging the queue.
                    warn!("Dropping undecodable task from {}: {}", queue, e);
                    let _: () = conn.lrem(Self::active_key(), 1, &encoded).await?;
                    let dead = serde_json::json!({"raw": encoded, "reason": "undecodable"});
                    let _: () = conn.lpush(Self::dead_key(), dead.to_string()).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn ack(&self, task: &TaskMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(task)?;
        let _: () = conn.lrem(Self::active_key(), 1, encoded).await?;
        Ok(())
    }

    async fn schedule_retry(&self, task: &TaskMessage, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(task)?;

        let mut bumped = task.clone();
        bumped.retried += 1;
        let bumped_encoded = serde_json::to_string(&bumped)?;
        let due = Self::now_epoch() + delay.as_secs_f64();

        let _: () = conn.lrem(Self::active_key(), 1, encoded).await?;
        let _: () = conn.zadd(Self::scheduled_key(), bumped_encoded, due).await?;
        Ok(())
    }

    async fn dead_letter(&self, task: &TaskMessage, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(task)?;
        let dead = serde_json::to_string(&DeadTask {
            task: task.clone(),
            reason: reason.to_string(),
        })?;

        let _: () = conn.lrem(Self::active_key(), 1, encoded).await?;
        let _: () = conn.lpush(Self::dead_key(), dead).await?;
        Ok(())
    }

    async fn pump_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn().await?;
        let now = Self::now_epoch();

        let due: Vec<String> = conn
            .zrangebyscore(Self::scheduled_key(), 0f64, now)
            .await?;

        let mut moved = 0;
        for encoded in due {
            let removed: i64 = conn.zrem(Self::scheduled_key(), &encoded).await?;
            if removed == 0 {
                // Another engine process already claimed it.
                continue;
            }
            match serde_json::from_str::<TaskMessage>(&encoded) {
                Ok(task) => {
                    let _: () = conn.lpush(Self::pending_key(&task.queue), &encoded).await?;
                    moved += 1;
                }
                Err(e) => {
                    warn!("Dropping undecodable scheduled task: {}", e);
                    let dead = serde_json::json!({"raw": encoded, "reason": "undecodable"});
                    let _: () = conn.lpush(Self::dead_key(), dead.to_string()).await?;
                }
            }
        }
        Ok(moved)
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn().await?;
        let depth: usize = conn.llen(Self::pending_key(queue)).await?;
        Ok(depth)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadTask>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.lrange(Self::dead_key(), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }
}

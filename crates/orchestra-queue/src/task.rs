use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Long-running SSH fan-outs: installs, joins, env push.
pub const QUEUE_PROVISIONING: &str = "provisioning";
/// Short, latency-sensitive orchestrator API calls.
pub const QUEUE_DEPLOYMENT: &str = "deployment";
/// Everything else.
pub const QUEUE_DEFAULT: &str = "default";

/// One unit of work. The payload is the task's identity; tasks own no
/// persistent state beyond the row they operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub max_retry: u32,
    #[serde(default)]
    pub retried: u32,
}

impl TaskMessage {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            queue: QUEUE_DEFAULT.to_string(),
            max_retry: 2,
            retried: 0,
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Decode the payload. A malformed payload is unrecoverable, so the
    /// error skips the retry budget and dead-letters immediately.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TaskError::SkipRetry(format!("invalid payload: {}", e)))
    }
}

/// How a handler failure is treated by the dispatcher.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Unrecoverable payload error. Dead-lettered immediately, no retry.
    #[error("{0}")]
    SkipRetry(String),

    /// The task cannot succeed no matter how often it runs (missing row,
    /// undecryptable secret). Ends with error, no retry.
    #[error("{0}")]
    Fatal(String),

    /// Transient failure. Requeued with exponential backoff until the
    /// retry ceiling.
    #[error(transparent)]
    Retryable(#[from] anyhow::Error),
}

impl TaskError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        TaskError::Fatal(msg.into())
    }

    pub fn retryable<E: Into<anyhow::Error>>(err: E) -> Self {
        TaskError::Retryable(err.into())
    }
}

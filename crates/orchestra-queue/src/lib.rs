//! Task queue: named, priority-weighted work queues with at-least-once
//! delivery, bounded retries and dead-lettering.
//!
//! `QueueBackend` abstracts the transport. `RedisQueue` is the production
//! backend; `MemoryQueue` backs tests. The `Dispatcher` pulls tasks with a
//! weighted draw across queues and runs them on a fixed worker pool.

pub mod backend;
pub mod dispatcher;
pub mod handler;
pub mod redis_queue;
pub mod task;

pub use backend::{DeadTask, MemoryQueue, QueueBackend, QueueError};
pub use dispatcher::{Dispatcher, DispatcherConfig, WeightedQueue};
pub use handler::{HandlerRegistry, TaskHandler};
pub use redis_queue::RedisQueue;
pub use task::{TaskError, TaskMessage, QUEUE_DEFAULT, QUEUE_DEPLOYMENT, QUEUE_PROVISIONING};

//! Multi-worker dispatcher with weighted queue selection.
//!
//! A fixed pool of workers pulls tasks to completion. On each free slot the
//! worker draws a queue with probability proportional to its weight and
//! falls through to the remaining queues when the drawn one is empty, so
//! non-empty queues keep their relative ratios. A pump loop moves due
//! retries back onto their queues.

use crate::backend::QueueBackend;
use crate::handler::HandlerRegistry;
use crate::task::{TaskError, TaskMessage};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct WeightedQueue {
    pub name: String,
    pub weight: u32,
}

impl WeightedQueue {
    pub fn new(name: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub concurrency: usize,
    pub queues: Vec<WeightedQueue>,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on any retry delay.
    pub backoff_cap: Duration,
    /// Deadline for a single handler run. An elapsed deadline counts as a
    /// retryable failure; the in-flight remote command is abandoned.
    pub task_timeout: Duration,
    pub idle_sleep: Duration,
    pub pump_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![
                WeightedQueue::new(crate::task::QUEUE_PROVISIONING, 6),
                WeightedQueue::new(crate::task::QUEUE_DEPLOYMENT, 3),
                WeightedQueue::new(crate::task::QUEUE_DEFAULT, 1),
            ],
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(900),
            task_timeout: Duration::from_secs(30 * 60),
            idle_sleep: Duration::from_millis(500),
            pump_interval: Duration::from_secs(1),
        }
    }
}

/// Draw queues without replacement, each draw weighted by the remaining
/// weights. The resulting order is the worker's dequeue preference.
pub fn weighted_order<R: Rng>(queues: &[WeightedQueue], rng: &mut R) -> Vec<String> {
    let mut remaining: Vec<&WeightedQueue> = queues.iter().filter(|q| q.weight > 0).collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let total: u32 = remaining.iter().map(|q| q.weight).sum();
        let mut roll = rng.gen_range(0..total);
        let mut picked = 0;
        for (i, q) in remaining.iter().enumerate() {
            if roll < q.weight {
                picked = i;
                break;
            }
            roll -= q.weight;
        }
        order.push(remaining.remove(picked).name.clone());
    }
    order
}

pub struct Dispatcher {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
        }
    }

    /// Run workers and the retry pump until `shutdown` flips to true.
    /// In-flight tasks run to completion before workers exit.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.concurrency,
            queues = ?self.config.queues.iter().map(|q| format!("{} ({})", q.name, q.weight)).collect::<Vec<_>>(),
            "Dispatcher starting"
        );

        let mut set = JoinSet::new();

        // Retry pump
        {
            let backend = Arc::clone(&self.backend);
            let interval = self.config.pump_interval;
            let mut shutdown = shutdown.clone();
            set.spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = backend.pump_due().await {
                        warn!("Retry pump failed: {}", e);
                    }
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            });
        }

        for worker_id in 0..self.config.concurrency {
            let backend = Arc::clone(&self.backend);
            let registry = Arc::clone(&self.registry);
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move {
                worker_loop(worker_id, backend, registry, config, shutdown).await;
            });
        }

        while set.join_next().await.is_some() {}
        info!("Dispatcher stopped");
    }

    /// Run one task through its handler and settle the outcome with the
    /// backend. Exposed for deterministic tests.
    pub async fn process_task(&self, task: TaskMessage) {
        process_task(&*self.backend, &self.registry, &self.config, task).await;
    }
}

async fn worker_loop(
    worker_id: usize,
    backend: Arc<dyn QueueBackend>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let order = weighted_order(&config.queues, &mut rand::thread_rng());
        let mut task = None;
        for queue in &order {
            match backend.dequeue(queue).await {
                Ok(Some(t)) => {
                    task = Some(t);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id, queue = %queue, "Dequeue failed: {}", e);
                    break;
                }
            }
        }

        match task {
            Some(task) => process_task(&*backend, &registry, &config, task).await,
            None => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(config.idle_sleep) => {}
                }
            }
        }
    }
}

async fn process_task(
    backend: &dyn QueueBackend,
    registry: &HandlerRegistry,
    config: &DispatcherConfig,
    task: TaskMessage,
) {
    let Some(handler) = registry.get(&task.kind) else {
        error!(kind = %task.kind, id = %task.id, "No handler registered");
        if let Err(e) = backend.dead_letter(&task, "no handler registered").await {
            error!("Failed to dead-letter task {}: {}", task.id, e);
        }
        return;
    };

    let result = match tokio::time::timeout(config.task_timeout, handler.handle(&task)).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::retryable(anyhow::anyhow!(
            "task deadline exceeded after {:?}",
            config.task_timeout
        ))),
    };

    let outcome = match result {
        Ok(()) => backend.ack(&task).await,
        Err(TaskError::SkipRetry(reason)) => {
            warn!(kind = %task.kind, id = %task.id, "Task dead-lettered (skip-retry): {}", reason);
            backend.dead_letter(&task, &reason).await
        }
        Err(TaskError::Fatal(reason)) => {
            warn!(kind = %task.kind, id = %task.id, "Task failed terminally: {}", reason);
            backend.dead_letter(&task, &reason).await
        }
        Err(TaskError::Retryable(err)) => {
            if task.retried < task.max_retry {
                let delay = backoff_delay(config, task.retried);
                warn!(
                    kind = %task.kind,
                    id = %task.id,
                    attempt = task.retried + 1,
                    max = task.max_retry,
                    delay_secs = delay.as_secs(),
                    "Task failed, retrying: {}",
                    err
                );
                backend.schedule_retry(&task, delay).await
            } else {
                warn!(
                    kind = %task.kind,
                    id = %task.id,
                    "Task exhausted {} retries: {}",
                    task.max_retry,
                    err
                );
                backend
                    .dead_letter(&task, &format!("retry budget exhausted: {}", err))
                    .await
            }
        }
    };

    if let Err(e) = outcome {
        error!(id = %task.id, "Failed to settle task outcome: {}", e);
    }
}

/// Exponential backoff with ±50% jitter: `base * 2^retried`, capped.
fn backoff_delay(config: &DispatcherConfig, retried: u32) -> Duration {
    let exp = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(retried.min(16)));
    let capped = exp.min(config.backoff_cap);
    if capped.is_zero() {
        return capped;
    }
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    capped.mul_f64(jitter).min(config.backoff_cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryQueue;
    use crate::handler::TaskHandler;
    use crate::task::{QUEUE_DEFAULT, QUEUE_DEPLOYMENT, QUEUE_PROVISIONING};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_weighted_draw_ratio() {
        let queues = vec![
            WeightedQueue::new(QUEUE_PROVISIONING, 6),
            WeightedQueue::new(QUEUE_DEPLOYMENT, 3),
            WeightedQueue::new(QUEUE_DEFAULT, 1),
        ];

        let mut rng = rand::thread_rng();
        let mut first_picks: HashMap<String, u32> = HashMap::new();
        let rounds = 20_000;
        for _ in 0..rounds {
            let order = weighted_order(&queues, &mut rng);
            *first_picks.entry(order[0].clone()).or_default() += 1;
        }

        let ratio = |name: &str| *first_picks.get(name).unwrap_or(&0) as f64 / rounds as f64;
        // Expected 0.6 : 0.3 : 0.1 within statistical noise
        assert!((ratio(QUEUE_PROVISIONING) - 0.6).abs() < 0.03);
        assert!((ratio(QUEUE_DEPLOYMENT) - 0.3).abs() < 0.03);
        assert!((ratio(QUEUE_DEFAULT) - 0.1).abs() < 0.03);
    }

    #[test]
    fn test_weighted_order_contains_all_queues() {
        let queues = DispatcherConfig::default().queues;
        let order = weighted_order(&queues, &mut rand::thread_rng());
        assert_eq!(order.len(), 3);
        for q in &queues {
            assert!(order.contains(&q.name));
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = DispatcherConfig {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            ..Default::default()
        };

        // Jitter is ±50%, so attempt 0 stays under 1.5s and attempt 3
        // lands around 8s.
        assert!(backoff_delay(&config, 0) <= Duration::from_millis(1500));
        let d3 = backoff_delay(&config, 3);
        assert!(d3 >= Duration::from_secs(4) && d3 <= Duration::from_secs(12));
        assert!(backoff_delay(&config, 20) <= Duration::from_secs(60));
    }

    struct FlakyHandler {
        failures_remaining: AtomicU32,
        runs: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn handle(&self, _task: &TaskMessage) -> Result<(), TaskError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(TaskError::retryable(anyhow::anyhow!("transient")));
            }
            Ok(())
        }
    }

    struct PoisonHandler;

    #[async_trait]
    impl TaskHandler for PoisonHandler {
        async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
            let _: i64 = task.payload_as()?;
            Ok(())
        }
    }

    fn test_dispatcher(
        backend: Arc<MemoryQueue>,
        registry: HandlerRegistry,
    ) -> Dispatcher {
        let config = DispatcherConfig {
            backoff_base: Duration::from_millis(0),
            ..Default::default()
        };
        Dispatcher::new(backend, Arc::new(registry), config)
    }

    /// Drain every queue through the dispatcher until nothing is pending.
    async fn drain(dispatcher: &Dispatcher, backend: &MemoryQueue) {
        loop {
            backend.pump_due().await.unwrap();
            let mut any = false;
            for queue in [QUEUE_PROVISIONING, QUEUE_DEPLOYMENT, QUEUE_DEFAULT] {
                while let Some(task) = backend.dequeue(queue).await.unwrap() {
                    dispatcher.process_task(task).await;
                    any = true;
                }
            }
            backend.pump_due().await.unwrap();
            if !any && backend.scheduled_count() == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let backend = Arc::new(MemoryQueue::new());
        let handler = Arc::new(FlakyHandler {
            failures_remaining: AtomicU32::new(2),
            runs: AtomicU32::new(0),
        });
        let mut registry = HandlerRegistry::new();
        registry.register("flaky", handler.clone());
        let dispatcher = test_dispatcher(backend.clone(), registry);

        backend
            .enqueue(TaskMessage::new("flaky", json!({})).max_retry(3))
            .await
            .unwrap();
        drain(&dispatcher, &backend).await;

        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        assert!(backend.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_dead_letters() {
        let backend = Arc::new(MemoryQueue::new());
        let handler = Arc::new(FlakyHandler {
            failures_remaining: AtomicU32::new(u32::MAX),
            runs: AtomicU32::new(0),
        });
        let mut registry = HandlerRegistry::new();
        registry.register("doomed", handler.clone());
        let dispatcher = test_dispatcher(backend.clone(), registry);

        backend
            .enqueue(TaskMessage::new("doomed", json!({})).max_retry(2))
            .await
            .unwrap();
        drain(&dispatcher, &backend).await;

        // Initial run + 2 retries
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        let dead = backend.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_skip_retry_dead_letters_immediately() {
        let backend = Arc::new(MemoryQueue::new());
        let mut registry = HandlerRegistry::new();
        registry.register("poison", Arc::new(PoisonHandler));
        let dispatcher = test_dispatcher(backend.clone(), registry);

        backend
            .enqueue(TaskMessage::new("poison", json!({"not": "an i64"})).max_retry(5))
            .await
            .unwrap();
        drain(&dispatcher, &backend).await;

        let dead = backend.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task.retried, 0);
    }

    #[tokio::test]
    async fn test_unregistered_kind_dead_letters() {
        let backend = Arc::new(MemoryQueue::new());
        let dispatcher = test_dispatcher(backend.clone(), HandlerRegistry::new());

        backend
            .enqueue(TaskMessage::new("nobody:home", json!({})))
            .await
            .unwrap();
        drain(&dispatcher, &backend).await;

        let dead = backend.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("no handler"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let backend = Arc::new(MemoryQueue::new());
        let dispatcher = test_dispatcher(backend, HandlerRegistry::new());

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { dispatcher.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}

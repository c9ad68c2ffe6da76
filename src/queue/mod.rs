//! Work queue between the orchestrator and its workers
//!
//! This module provides:
//! - `Broker`: a list-structured broker with named channels (Redis or in-memory)
//! - `WorkQueue`: typed task and result channels on top of a broker
//! - versioned, field-named envelopes for everything crossing the broker
//!
//! Delivery is at-least-once and unordered across workers; the dedup
//! persistence on the orchestrator side makes redelivery harmless.

mod envelope;
mod memory;
mod redis_broker;

pub use envelope::{decode, encode, EnvelopeKind, ENVELOPE_VERSION};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use crate::config::{QueueBackend, QueueConfig};
use crate::model::{Task, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Errors that can occur on the work queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Envelope JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Broker lock poisoned")]
    LockPoisoned,
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// A list-structured message broker with named channels
///
/// `push` adds to one end and `pop` removes from the other, so each channel
/// behaves as a FIFO. `pop` never blocks.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn push(&self, channel: &str, payload: String) -> QueueResult<()>;

    async fn pop(&self, channel: &str) -> QueueResult<Option<String>>;

    async fn len(&self, channel: &str) -> QueueResult<usize>;
}

/// Opens the configured broker
pub async fn open_broker(config: &QueueConfig) -> QueueResult<Arc<dyn Broker>> {
    match config.backend {
        QueueBackend::Redis => Ok(Arc::new(RedisBroker::connect(&config.redis_url).await?)),
        QueueBackend::Memory => Ok(Arc::new(MemoryBroker::new())),
    }
}

/// Typed task and result channels over a broker
#[derive(Clone)]
pub struct WorkQueue {
    broker: Arc<dyn Broker>,
    task_channel: String,
    result_channel: String,
    poll_interval: Duration,
}

impl WorkQueue {
    pub fn new(broker: Arc<dyn Broker>, config: &QueueConfig) -> Self {
        Self {
            broker,
            task_channel: config.task_channel.clone(),
            result_channel: config.result_channel.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    pub async fn push_task(&self, task: &Task) -> QueueResult<()> {
        self.broker
            .push(&self.task_channel, encode(task)?)
            .await
    }

    /// Takes one task if any is waiting
    pub async fn pop_task(&self) -> QueueResult<Option<Task>> {
        match self.broker.pop(&self.task_channel).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Waits for the next task, polling at the configured interval
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Task))` - A task arrived
    /// * `Ok(None)` - `cancel` fired, or nothing arrived within `max_wait`
    /// * `Err(QueueError)` - The broker failed or the envelope did not match
    pub async fn next_task(
        &self,
        cancel: &CancellationToken,
        max_wait: Option<Duration>,
    ) -> QueueResult<Option<Task>> {
        let deadline = max_wait.map(|wait| Instant::now() + wait);

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if let Some(task) = self.pop_task().await? {
                return Ok(Some(task));
            }

            let mut nap = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                nap = nap.min(deadline - now);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    pub async fn push_result(&self, result: &TaskResult) -> QueueResult<()> {
        self.broker
            .push(&self.result_channel, encode(result)?)
            .await
    }

    pub async fn pop_result(&self) -> QueueResult<Option<TaskResult>> {
        match self.broker.pop(&self.result_channel).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Takes every result currently waiting, up to `max`
    pub async fn drain_results(&self, max: usize) -> QueueResult<Vec<TaskResult>> {
        let mut results = Vec::new();
        while results.len() < max {
            match self.pop_result().await? {
                Some(result) => results.push(result),
                None => break,
            }
        }
        Ok(results)
    }

    /// Number of tasks published but not yet taken by a worker
    pub async fn pending_tasks(&self) -> QueueResult<usize> {
        self.broker.len(&self.task_channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    fn queue() -> (Arc<MemoryBroker>, WorkQueue) {
        let broker = Arc::new(MemoryBroker::new());
        let config = QueueConfig {
            backend: QueueBackend::Memory,
            poll_interval_ms: 5,
            ..QueueConfig::default()
        };
        let queue = WorkQueue::new(broker.clone(), &config);
        (broker, queue)
    }

    fn task(id: i64) -> Task {
        Task {
            id,
            page_number: id as u32,
            in_work: true,
            completed: false,
        }
    }

    #[tokio::test]
    async fn test_tasks_flow_in_order() {
        let (_, queue) = queue();
        queue.push_task(&task(1)).await.unwrap();
        queue.push_task(&task(2)).await.unwrap();

        assert_eq!(queue.pending_tasks().await.unwrap(), 2);
        assert_eq!(queue.pop_task().await.unwrap(), Some(task(1)));
        assert_eq!(queue.pop_task().await.unwrap(), Some(task(2)));
        assert_eq!(queue.pop_task().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_task_times_out() {
        let (_, queue) = queue();
        let cancel = CancellationToken::new();
        let got = queue
            .next_task(&cancel, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_next_task_waits_for_late_push() {
        let (_, queue) = queue();
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push_task(&task(5)).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let got = queue
            .next_task(&cancel, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(got, Some(task(5)));
    }

    #[tokio::test]
    async fn test_next_task_cancelled() {
        let (_, queue) = queue();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.next_task(&cancel, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_results_respects_max() {
        let (_, queue) = queue();
        for id in 1..=5 {
            queue
                .push_result(&TaskResult::empty(&task(id)))
                .await
                .unwrap();
        }

        let first = queue.drain_results(3).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.task_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(queue.drain_results(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_payload_is_fatal() {
        let (broker, queue) = queue();
        broker
            .push("tasks_queue", "[1, 1, false, false]".to_string())
            .await
            .unwrap();
        assert!(queue.pop_task().await.is_err());
    }
}

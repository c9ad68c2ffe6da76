//! Queue worker for distributed runs

use crate::config::{Config, QueueConfig};
use crate::crawler::pool::{Drain, DrainStats, PoolOptions, WorkerPool};
use crate::crawler::processor::PageProcessor;
use crate::model::TaskResult;
use crate::queue::WorkQueue;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Drain that publishes results to the result channel
pub struct PublishDrain {
    queue: WorkQueue,
}

impl PublishDrain {
    pub fn new(queue: WorkQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Drain<TaskResult> for PublishDrain {
    async fn drain(&self, batch: Vec<TaskResult>) -> Result<()> {
        for result in &batch {
            self.queue.push_result(result).await?;
            tracing::debug!(
                "Published result for page {} ({} records)",
                result.page_number,
                result.records.len()
            );
        }
        Ok(())
    }
}

/// Worker pool sizing and lifetime
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub pool: PoolOptions,

    /// Exit after this long without a task; `None` runs until cancelled
    pub idle_exit: Option<Duration>,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.queue, config.crawler.submit_poll(), config.crawler.drain_interval())
    }

    fn new(queue: &QueueConfig, submit_poll: Duration, drain_interval: Duration) -> Self {
        Self {
            pool: PoolOptions {
                max_concurrency: queue.worker_concurrency,
                submit_poll,
                drain_interval,
            },
            idle_exit: queue.worker_idle_exit(),
        }
    }
}

/// Summary of one worker's life
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub tasks_taken: usize,
    pub published: DrainStats,
}

/// Takes tasks off the queue until cancelled or idle, publishing one result per task
///
/// Every task resolves to a result, including pages past the end of the
/// listings, so the orchestrator can retire it. A listing page that could not
/// be loaded within the attempt cap yields nothing and is left to the
/// orchestrator's orphan sweep.
pub async fn run_worker(
    queue: WorkQueue,
    processor: PageProcessor,
    options: WorkerOptions,
    cancel: CancellationToken,
) -> Result<WorkerReport> {
    let pool = WorkerPool::start(options.pool, Arc::new(PublishDrain::new(queue.clone())));
    let mut report = WorkerReport::default();

    tracing::info!(
        "Worker started (pool size {})",
        options.pool.max_concurrency
    );

    loop {
        let task = match queue.next_task(&cancel, options.idle_exit).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                if cancel.is_cancelled() {
                    tracing::info!("Worker cancelled");
                } else {
                    tracing::info!("No tasks for {:?}, worker exiting", options.idle_exit);
                }
                break;
            }
            Err(e) => {
                tracing::error!("Task channel failed: {}", e);
                pool.close();
                match pool.shutdown().await {
                    Ok(published) => tracing::info!(
                        "Published {} results from {} tasks before stopping",
                        published.items,
                        report.tasks_taken
                    ),
                    Err(drain_error) => {
                        tracing::error!("Result publishing also failed: {}", drain_error)
                    }
                }
                return Err(e.into());
            }
        };

        tracing::debug!("Took task {} (page {})", task.id, task.page_number);
        let processor = processor.clone();
        let submitted = pool
            .submit(async move {
                match processor.process(&task).await {
                    Ok(result) => Some(result),
                    Err(e) => {
                        tracing::error!("Giving up on page {}: {}", task.page_number, e);
                        None
                    }
                }
            })
            .await;

        if submitted.is_err() {
            break;
        }
        report.tasks_taken += 1;
    }

    report.published = pool.shutdown().await?;
    tracing::info!(
        "Worker finished: {} tasks taken, {} results published",
        report.tasks_taken,
        report.published.items
    );
    Ok(report)
}

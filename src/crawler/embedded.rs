//! Single-process crawl: claim, process and commit without a broker

use crate::config::CrawlerConfig;
use crate::crawler::pool::{Drain, DrainStats, PoolOptions, WorkerPool};
use crate::crawler::processor::PageProcessor;
use crate::model::{TaskResult, TaskStatus};
use crate::storage::{commit_results, Storage, StorageResult, TaskStore};
use crate::Result;
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drain that persists results and marks their tasks completed
pub struct CommitDrain {
    storage: Arc<dyn Storage>,
}

impl CommitDrain {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Drain<TaskResult> for CommitDrain {
    async fn drain(&self, batch: Vec<TaskResult>) -> Result<()> {
        let report = commit_results(self.storage.as_ref(), batch).await?;
        tracing::debug!(
            "Committed {} tasks ({} new records, {} duplicates)",
            report.completed,
            report.records.inserted,
            report.records.duplicates
        );
        Ok(())
    }
}

/// Creates tasks for `range` unless the store already holds tasks
///
/// # Returns
///
/// * `Ok(n)` - Number of tasks created, zero when the store was already seeded
pub async fn seed_if_empty(storage: &dyn Storage, range: RangeInclusive<u32>) -> StorageResult<usize> {
    let mut existing = 0;
    for status in TaskStatus::ALL {
        existing += storage.count_tasks(status).await?;
    }

    if existing > 0 {
        tracing::info!("Task store already holds {} tasks, not seeding", existing);
        return Ok(0);
    }

    let created = storage.create_tasks(range.clone()).await?;
    tracing::info!(
        "Seeded {} tasks for pages {}..={}",
        created,
        range.start(),
        range.end()
    );
    Ok(created)
}

/// Summary of an embedded run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedReport {
    pub orphans_reset: u64,
    pub dispatched: usize,
    pub drained: DrainStats,
    pub exhausted: bool,
    pub cancelled: bool,
}

/// Runs a whole crawl in this process
///
/// Resets orphaned tasks, then claims idle tasks in batches of
/// `max_concurrency` and feeds them to a bounded pool whose drain commits
/// results. Claiming stops when a page reports the end of the listings, when
/// no idle task is left, or when `cancel` fires. Claimed tasks that were never
/// submitted stay in progress and are picked up by the next run's orphan sweep.
///
/// # Arguments
///
/// * `storage` - Task and record store
/// * `processor` - Turns one task into one result
/// * `config` - Concurrency and timing settings
/// * `seed` - Create tasks for the configured range when the store is empty
/// * `cancel` - Stops claiming; live units still finish and are committed
pub async fn run_embedded(
    storage: Arc<dyn Storage>,
    processor: PageProcessor,
    config: &CrawlerConfig,
    seed: bool,
    cancel: CancellationToken,
) -> Result<EmbeddedReport> {
    let mut report = EmbeddedReport {
        orphans_reset: storage.reset_orphaned_tasks().await?,
        ..EmbeddedReport::default()
    };
    if report.orphans_reset > 0 {
        tracing::warn!("Reset {} orphaned tasks", report.orphans_reset);
    }

    if seed {
        seed_if_empty(storage.as_ref(), config.page_range()).await?;
    }

    let pool = WorkerPool::start(
        PoolOptions {
            max_concurrency: config.max_concurrency,
            submit_poll: config.submit_poll(),
            drain_interval: config.drain_interval(),
        },
        Arc::new(CommitDrain::new(Arc::clone(&storage))),
    );
    let exhausted = Arc::new(AtomicBool::new(false));

    'claim: loop {
        if cancel.is_cancelled() || exhausted.load(Ordering::SeqCst) || pool.has_failed() {
            break;
        }

        let tasks = storage.claim_idle_tasks(config.max_concurrency).await?;
        if tasks.is_empty() {
            tracing::info!("No idle tasks left");
            break;
        }
        tracing::debug!("Claimed {} tasks", tasks.len());

        for task in tasks {
            if cancel.is_cancelled() || exhausted.load(Ordering::SeqCst) {
                break 'claim;
            }

            let processor = processor.clone();
            let exhausted = Arc::clone(&exhausted);
            let submitted = pool
                .submit(async move {
                    match processor.process(&task).await {
                        Ok(result) => {
                            if result.listings_exhausted {
                                exhausted.store(true, Ordering::SeqCst);
                            }
                            Some(result)
                        }
                        Err(e) => {
                            tracing::error!(
                                "Leaving page {} for a later run: {}",
                                task.page_number,
                                e
                            );
                            None
                        }
                    }
                })
                .await;

            if submitted.is_err() {
                break 'claim;
            }
            report.dispatched += 1;
        }
    }

    report.cancelled = cancel.is_cancelled();
    report.exhausted = exhausted.load(Ordering::SeqCst);
    if report.cancelled {
        tracing::info!("Cancellation requested, waiting for live pages");
    }

    report.drained = pool.shutdown().await?;
    tracing::info!(
        "Embedded run finished: {} pages dispatched, {} results committed",
        report.dispatched,
        report.drained.items
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, Task};
    use crate::storage::{RecordStore, SqliteStorage};

    fn storage() -> Arc<dyn Storage> {
        Arc::new(SqliteStorage::open_in_memory().unwrap())
    }

    fn result(task: &Task, identities: &[&str]) -> TaskResult {
        let mut result = TaskResult::empty(task);
        for identity in identities {
            result.records.push(
                Record::new(format!("https://example.com/{}", identity)).with_identity(*identity),
            );
        }
        result
    }

    #[tokio::test]
    async fn test_seed_if_empty_only_seeds_once() {
        let storage = storage();
        assert_eq!(seed_if_empty(storage.as_ref(), 1..=4).await.unwrap(), 4);
        assert_eq!(seed_if_empty(storage.as_ref(), 1..=4).await.unwrap(), 0);
        assert_eq!(storage.count_tasks(TaskStatus::Idle).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_commit_drain_persists_and_completes() {
        let storage = storage();
        storage.create_tasks(1..=2).await.unwrap();
        let tasks = storage.claim_idle_tasks(2).await.unwrap();

        let drain = CommitDrain::new(Arc::clone(&storage));
        drain
            .drain(vec![
                result(&tasks[0], &["A", "B"]),
                result(&tasks[1], &["B", "C"]),
            ])
            .await
            .unwrap();

        assert_eq!(storage.count_records().await.unwrap(), 3);
        assert_eq!(storage.count_tasks(TaskStatus::Done).await.unwrap(), 2);
    }
}

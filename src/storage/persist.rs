//! Dedup-persistence protocol
//!
//! Records are written insert-only and at most once per identity:
//! - records without an identity are skipped
//! - identities already stored, or seen earlier in the same batch, are skipped
//! - the rest are inserted in one transaction; rows rejected by the store's
//!   unique constraint lost a race with a concurrent writer and count as duplicates
//!
//! Duplicates are an expected steady-state condition, not an error.

use crate::model::{Record, TaskResult};
use crate::storage::traits::{RecordStore, StorageResult, TaskStore};
use crate::storage::Storage;
use std::collections::HashSet;

/// What one `persist` call did with its input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub missing_identity: usize,
}

impl PersistReport {
    pub fn merge(&mut self, other: PersistReport) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.missing_identity += other.missing_identity;
    }
}

/// Persists a batch of records through the dedup protocol
///
/// # Arguments
///
/// * `store` - The record store
/// * `records` - Extracted records, possibly with repeated or missing identities
///
/// # Returns
///
/// * `Ok(PersistReport)` - Counts of inserted and skipped records
/// * `Err(StorageError)` - The store failed; nothing from the insert step was committed
pub async fn persist<S>(store: &S, records: Vec<Record>) -> StorageResult<PersistReport>
where
    S: RecordStore + ?Sized,
{
    let mut report = PersistReport::default();

    let mut keyed: Vec<(String, Record)> = Vec::with_capacity(records.len());
    for record in records {
        match record.identity_key().map(str::to_string) {
            Some(identity) => keyed.push((identity, record)),
            None => {
                report.missing_identity += 1;
                tracing::warn!("Skipping record without identity: {}", record.url);
            }
        }
    }

    if keyed.is_empty() {
        return Ok(report);
    }

    let candidates: Vec<String> = keyed
        .iter()
        .map(|(identity, _)| identity.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    // One exclusion set covers both identities already stored and those
    // claimed earlier in this batch
    let mut excluded = store.existing_identities(&candidates).await?;

    let mut fresh = Vec::with_capacity(keyed.len());
    for (identity, record) in keyed {
        if excluded.insert(identity.clone()) {
            fresh.push(record);
        } else {
            report.duplicates += 1;
            tracing::warn!("Skipping duplicate record {} ({})", identity, record.url);
        }
    }

    let outcome = store.insert_records(&fresh).await?;
    if outcome.conflicts > 0 {
        tracing::warn!(
            "{} records lost an insert race to a concurrent writer",
            outcome.conflicts
        );
    }

    report.inserted = outcome.inserted;
    report.duplicates += outcome.conflicts;

    tracing::debug!(
        "Persisted batch: {} inserted, {} duplicates, {} without identity",
        report.inserted,
        report.duplicates,
        report.missing_identity
    );

    Ok(report)
}

/// Outcome of committing a batch of task results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub records: PersistReport,

    /// Tasks retired to DONE
    pub completed: usize,

    /// Results naming a task the store does not know
    pub unknown_tasks: usize,
}

/// Commits task results: persists their records, then retires their tasks
///
/// All records of the batch go through a single `persist` call. A task is
/// completed whether or not its records were stored, since completion tracks
/// work done rather than rows inserted.
pub async fn commit_results<S>(store: &S, results: Vec<TaskResult>) -> StorageResult<CommitReport>
where
    S: Storage + ?Sized,
{
    let mut report = CommitReport::default();
    if results.is_empty() {
        return Ok(report);
    }

    let mut task_ids = Vec::with_capacity(results.len());
    let mut records = Vec::new();
    for result in results {
        task_ids.push((result.task_id, result.page_number));
        records.extend(result.records);
    }

    report.records = persist(store, records).await?;

    for (task_id, page_number) in task_ids {
        match store.get_task(task_id).await? {
            Some(task) if task.completed => {
                tracing::debug!("Task {} (page {}) already completed", task_id, page_number);
            }
            Some(_) => {
                store.mark_completed(task_id).await?;
                report.completed += 1;
            }
            None => {
                report.unknown_tasks += 1;
                tracing::warn!(
                    "Result for unknown task {} (page {}); records kept, nothing to complete",
                    task_id,
                    page_number
                );
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::storage::SqliteStorage;

    fn record(identity: &str) -> Record {
        Record::new(format!("https://listings.example.com/{}", identity)).with_identity(identity)
    }

    #[tokio::test]
    async fn test_repeated_identities_collapse() {
        let store = SqliteStorage::open_in_memory().unwrap();

        let first = persist(&store, vec![record("A"), record("A"), record("B")])
            .await
            .unwrap();
        assert_eq!(
            first,
            PersistReport {
                inserted: 2,
                duplicates: 1,
                missing_identity: 0
            }
        );

        let second = persist(&store, vec![record("A")]).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);

        assert_eq!(store.count_records().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_identity_dropped() {
        let store = SqliteStorage::open_in_memory().unwrap();

        let report = persist(
            &store,
            vec![
                record(""),
                Record::new("https://listings.example.com/none"),
                record("   "),
            ],
        )
        .await
        .unwrap();

        assert_eq!(report.missing_identity, 3);
        assert_eq!(report.inserted, 0);
        assert_eq!(store.count_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let report = persist(&store, Vec::new()).await.unwrap();
        assert_eq!(report, PersistReport::default());
    }

    #[tokio::test]
    async fn test_first_occurrence_wins() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let mut first = record("A");
        first.title = Some("first".to_string());
        let mut second = record("A");
        second.title = Some("second".to_string());

        persist(&store, vec![first, second]).await.unwrap();
        let stored = store.get_record("A").await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_retried_delivery_is_idempotent() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let batch = vec![record("A"), record("B"), record("C")];

        for _ in 0..3 {
            persist(&store, batch.clone()).await.unwrap();
        }
        assert_eq!(store.count_records().await.unwrap(), 3);
    }

    async fn claimed(store: &SqliteStorage, pages: std::ops::RangeInclusive<u32>) -> Vec<Task> {
        let count = pages.clone().count();
        store.create_tasks(pages).await.unwrap();
        store.claim_idle_tasks(count).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_results_completes_tasks() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let tasks = claimed(&store, 1..=3).await;

        let results = vec![
            TaskResult {
                records: vec![record("A"), record("B")],
                ..TaskResult::empty(&tasks[0])
            },
            TaskResult {
                records: vec![record("B")],
                ..TaskResult::empty(&tasks[1])
            },
            TaskResult::exhausted(&tasks[2]),
        ];

        let report = commit_results(&store, results).await.unwrap();
        assert_eq!(report.records.inserted, 2);
        assert_eq!(report.records.duplicates, 1);
        assert_eq!(report.completed, 3);

        for task in &tasks {
            assert!(store.get_task(task.id).await.unwrap().unwrap().completed);
        }
    }

    #[tokio::test]
    async fn test_commit_result_for_unknown_task() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let phantom = Task {
            id: 404,
            page_number: 9,
            in_work: true,
            completed: false,
        };

        let report = commit_results(
            &store,
            vec![TaskResult {
                records: vec![record("A")],
                ..TaskResult::empty(&phantom)
            }],
        )
        .await
        .unwrap();

        assert_eq!(report.unknown_tasks, 1);
        assert_eq!(report.completed, 0);
        assert_eq!(report.records.inserted, 1);
    }

    #[tokio::test]
    async fn test_redelivered_result_after_completion() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let tasks = claimed(&store, 1..=1).await;
        let result = TaskResult {
            records: vec![record("A")],
            ..TaskResult::empty(&tasks[0])
        };

        commit_results(&store, vec![result.clone()]).await.unwrap();
        let again = commit_results(&store, vec![result]).await.unwrap();

        assert_eq!(again.completed, 0);
        assert_eq!(again.records.duplicates, 1);
        assert_eq!(store.count_records().await.unwrap(), 1);
    }
}

//! Statistics from the task and record stores
//!
//! This module provides functionality for loading task progress and record
//! counts from storage and rendering them for the terminal.

use crate::model::TaskStatus;
use crate::storage::{RecordStore, Storage, StorageResult, TaskStore};
use std::fmt::Write;

/// Crawl progress summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatistics {
    /// Tasks waiting to be claimed
    pub idle: u64,

    /// Tasks claimed but not yet completed
    pub in_progress: u64,

    /// Tasks completed
    pub done: u64,

    /// Distinct records stored
    pub records: u64,
}

impl RunStatistics {
    pub fn total_tasks(&self) -> u64 {
        self.idle + self.in_progress + self.done
    }

    fn count(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Idle => self.idle,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Done => self.done,
        }
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(RunStatistics)` - Successfully loaded statistics
/// * `Err(StorageError)` - Failed to query statistics
pub async fn load_statistics(storage: &dyn Storage) -> StorageResult<RunStatistics> {
    Ok(RunStatistics {
        idle: storage.count_tasks(TaskStatus::Idle).await?,
        in_progress: storage.count_tasks(TaskStatus::InProgress).await?,
        done: storage.count_tasks(TaskStatus::Done).await?,
        records: storage.count_records().await?,
    })
}

/// Renders statistics as the text `print_statistics` writes
pub fn render_statistics(stats: &RunStatistics) -> String {
    let total = stats.total_tasks();
    let mut out = String::new();

    let _ = writeln!(out, "=== Crawl Statistics ===\n");
    let _ = writeln!(out, "Tasks ({} total):", total);
    for status in TaskStatus::ALL {
        let count = stats.count(status);
        let percentage = if total > 0 {
            (count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let _ = writeln!(out, "  {}: {} ({:.1}%)", status, count, percentage);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Records stored: {}", stats.records);

    if stats.in_progress > 0 {
        let _ = writeln!(
            out,
            "\n{} tasks are in progress; if no crawl is running they are reset at the next start",
            stats.in_progress
        );
    }
    out
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &RunStatistics) {
    print!("{}", render_statistics(stats));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use crate::storage::SqliteStorage;

    #[tokio::test]
    async fn test_load_statistics() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_tasks(1..=4).await.unwrap();
        let claimed = storage.claim_idle_tasks(2).await.unwrap();
        storage.mark_completed(claimed[0].id).await.unwrap();
        storage
            .insert_records(&[Record::new("https://example.com/a").with_identity("A")])
            .await
            .unwrap();

        let stats = load_statistics(&storage).await.unwrap();
        assert_eq!(
            stats,
            RunStatistics {
                idle: 2,
                in_progress: 1,
                done: 1,
                records: 1,
            }
        );
        assert_eq!(stats.total_tasks(), 4);
    }

    #[test]
    fn test_render_statistics() {
        let stats = RunStatistics {
            idle: 1,
            in_progress: 0,
            done: 3,
            records: 42,
        };

        let text = render_statistics(&stats);
        assert!(text.contains("Tasks (4 total):"));
        assert!(text.contains("done: 3 (75.0%)"));
        assert!(text.contains("Records stored: 42"));
        assert!(!text.contains("reset at the next start"));
    }

    #[test]
    fn test_render_empty_store() {
        let text = render_statistics(&RunStatistics::default());
        assert!(text.contains("idle: 0 (0.0%)"));
    }
}

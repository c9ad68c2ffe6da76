//! Storage traits and error types
//!
//! This module defines the capability interfaces every store backend offers
//! and the associated error types.

use crate::model::{Record, Task, TaskStatus};
use async_trait::async_trait;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Blocking storage call failed: {0}")]
    Blocking(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dump target already exists: {}", .0.display())]
    DumpTargetExists(PathBuf),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// What a batch insert actually did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Rows written
    pub inserted: usize,

    /// Rows rejected by the store's unique identity constraint
    pub conflicts: usize,
}

/// Durable table of page tasks
///
/// Every state change goes through one of these operations; callers never
/// write the `in_work`/`completed` flags directly.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Bulk-creates one idle task per page number
    ///
    /// Fails with [`StorageError::ConstraintViolation`] if any page already has a
    /// task, leaving the store unchanged where the backend allows it.
    ///
    /// # Returns
    ///
    /// The number of tasks created
    async fn create_tasks(&self, pages: RangeInclusive<u32>) -> StorageResult<usize>;

    /// Returns every claimed but uncompleted task to idle
    ///
    /// Must run once at process start, before the first claim. Safe to repeat.
    ///
    /// # Returns
    ///
    /// The number of tasks reset
    async fn reset_orphaned_tasks(&self) -> StorageResult<u64>;

    /// Atomically claims up to `limit` idle tasks
    ///
    /// The returned tasks are already in progress. An empty vector means no
    /// idle tasks remain, which is the normal end of a crawl.
    async fn claim_idle_tasks(&self, limit: usize) -> StorageResult<Vec<Task>>;

    /// Marks a task completed; no-op if it already is
    async fn mark_completed(&self, task_id: i64) -> StorageResult<()>;

    /// Point lookup by id
    async fn get_task(&self, task_id: i64) -> StorageResult<Option<Task>>;

    /// Counts tasks in the given status
    async fn count_tasks(&self, status: TaskStatus) -> StorageResult<u64>;
}

/// Durable, insert-only table of extracted records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns the subset of `identities` already stored
    async fn existing_identities(&self, identities: &[String]) -> StorageResult<HashSet<String>>;

    /// Inserts a batch of records carrying identities, in one transaction where supported
    ///
    /// Rows whose identity is already stored are not written and are counted as
    /// conflicts. Any other failure aborts the batch.
    async fn insert_records(&self, records: &[Record]) -> StorageResult<InsertOutcome>;

    async fn count_records(&self) -> StorageResult<u64>;

    async fn get_record(&self, identity: &str) -> StorageResult<Option<Record>>;
}

/// What a dump wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    pub path: PathBuf,
    pub tasks: u64,
    pub records: u64,
}

/// Point-in-time copy of a whole store
#[async_trait]
pub trait StoreDump: Send + Sync {
    /// Writes every task and record to `target`
    ///
    /// Fails with [`StorageError::DumpTargetExists`] rather than overwrite an
    /// earlier dump.
    async fn dump(&self, target: &Path) -> StorageResult<DumpReport>;
}

/// A complete backend: task store, record store and dump
pub trait Storage: TaskStore + RecordStore + StoreDump {}

impl<T: TaskStore + RecordStore + StoreDump> Storage for T {}

//! SQLite storage implementation
//!
//! This module provides the relational backend for the task and record stores.
//! The connection sits behind a mutex so the store can be shared between the
//! drain loop and the dispatcher. Every call runs on the blocking thread pool,
//! since a writer may wait out another process's lock for the busy timeout.

use crate::model::{Record, Task, TaskStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{
    DumpReport, InsertOutcome, RecordStore, StorageError, StorageResult, StoreDump, TaskStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// SQLite caps bound parameters per statement; identity lookups are chunked below it
const IDENTITY_LOOKUP_CHUNK: usize = 500;

/// SQLite storage backend
///
/// Clones share one connection.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Opens or creates a database file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        // Several processes may share the file; writers wait instead of failing
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory database, used as the store in tests and dry runs
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Runs `op` on the blocking thread pool with its own handle to the store
    async fn run_blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&SqliteStorage) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || op(&storage))
            .await
            .map_err(|e| StorageError::Blocking(e.to_string()))?
    }

    fn create_tasks_sync(&self, pages: RangeInclusive<u32>) -> StorageResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut created = 0;
        {
            let mut stmt = tx.prepare("INSERT INTO tasks (page_number) VALUES (?1)")?;
            for page in pages {
                stmt.execute(params![page]).map_err(|e| match e {
                    rusqlite::Error::SqliteFailure(err, _)
                        if err.code == ErrorCode::ConstraintViolation =>
                    {
                        StorageError::ConstraintViolation(format!(
                            "task for page {} already exists",
                            page
                        ))
                    }
                    other => StorageError::Sqlite(other),
                })?;
                created += 1;
            }
        }

        tx.commit()?;
        Ok(created)
    }

    fn reset_orphaned_tasks_sync(&self) -> StorageResult<u64> {
        let conn = self.lock()?;
        let reset = conn.execute(
            "UPDATE tasks SET in_work = 0 WHERE in_work = 1 AND completed = 0",
            [],
        )?;
        Ok(reset as u64)
    }

    fn claim_idle_tasks_sync(&self, limit: usize) -> StorageResult<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so another process cannot
        // select the same idle rows between our SELECT and UPDATE
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut tasks = {
            let mut stmt = tx.prepare(
                "SELECT id, page_number FROM tasks
                 WHERE in_work = 0 AND completed = 0
                 ORDER BY page_number
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(Task {
                    id: row.get(0)?,
                    page_number: row.get(1)?,
                    in_work: false,
                    completed: false,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        {
            let mut stmt = tx.prepare("UPDATE tasks SET in_work = 1 WHERE id = ?1")?;
            for task in &mut tasks {
                stmt.execute(params![task.id])?;
                task.in_work = true;
            }
        }

        tx.commit()?;
        Ok(tasks)
    }

    fn mark_completed_sync(&self, task_id: i64) -> StorageResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE tasks SET completed = 1 WHERE id = ?1",
            params![task_id],
        )?;
        if updated == 0 {
            return Err(StorageError::TaskNotFound(task_id));
        }
        Ok(())
    }

    fn get_task_sync(&self, task_id: i64) -> StorageResult<Option<Task>> {
        let conn = self.lock()?;
        let task = conn
            .query_row(
                "SELECT id, page_number, in_work, completed FROM tasks WHERE id = ?1",
                params![task_id],
                |row| {
                    Ok(Task {
                        id: row.get(0)?,
                        page_number: row.get(1)?,
                        in_work: row.get(2)?,
                        completed: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(task)
    }

    fn count_tasks_sync(&self, status: TaskStatus) -> StorageResult<u64> {
        let filter = match status {
            TaskStatus::Idle => "in_work = 0 AND completed = 0",
            TaskStatus::InProgress => "in_work = 1 AND completed = 0",
            TaskStatus::Done => "completed = 1",
        };
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM tasks WHERE {}", filter),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn existing_identities_sync(&self, identities: &[String]) -> StorageResult<HashSet<String>> {
        let conn = self.lock()?;
        let mut found = HashSet::new();

        for chunk in identities.chunks(IDENTITY_LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT identity FROM records WHERE identity IN ({})",
                placeholders
            ))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for identity in rows {
                found.insert(identity?);
            }
        }

        Ok(found)
    }

    fn insert_records_sync(&self, records: &[Record]) -> StorageResult<InsertOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut outcome = InsertOutcome::default();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO records
                 (identity, url, title, price_usd, odometer, seller_name, phone_number,
                  image_url, images_count, plate_number, found_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(identity) DO NOTHING",
            )?;

            for record in records {
                let written = stmt.execute(params![
                    record.identity_key(),
                    record.url,
                    record.title,
                    record.price_usd,
                    record.odometer,
                    record.seller_name,
                    record.phone_number,
                    record.image_url,
                    record.images_count,
                    record.plate_number,
                    record.found_at.to_rfc3339(),
                ])?;
                if written == 0 {
                    outcome.conflicts += 1;
                } else {
                    outcome.inserted += 1;
                }
            }
        }

        // Dropping an uncommitted transaction rolls it back, so an error above
        // leaves none of the batch behind
        tx.commit()?;
        Ok(outcome)
    }

    fn count_records_sync(&self) -> StorageResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn dump_sync(&self, target: &Path) -> StorageResult<DumpReport> {
        if target.exists() {
            return Err(StorageError::DumpTargetExists(target.to_path_buf()));
        }
        let destination = target.to_str().ok_or_else(|| {
            StorageError::Serialization(format!("dump path is not UTF-8: {}", target.display()))
        })?;

        let conn = self.lock()?;
        let tasks: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        let records: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        // Writes a compacted, consistent copy without touching the live file
        conn.execute("VACUUM INTO ?1", params![destination])?;

        Ok(DumpReport {
            path: target.to_path_buf(),
            tasks: tasks as u64,
            records: records as u64,
        })
    }

    fn get_record_sync(&self, identity: &str) -> StorageResult<Option<Record>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT identity, url, title, price_usd, odometer, seller_name, phone_number,
                        image_url, images_count, plate_number, found_at
                 FROM records WHERE identity = ?1",
                params![identity],
                |row| {
                    Ok((
                        Record {
                            identity: row.get(0)?,
                            url: row.get(1)?,
                            title: row.get(2)?,
                            price_usd: row.get(3)?,
                            odometer: row.get(4)?,
                            seller_name: row.get(5)?,
                            phone_number: row.get(6)?,
                            image_url: row.get(7)?,
                            images_count: row.get(8)?,
                            plate_number: row.get(9)?,
                            found_at: Utc::now(),
                        },
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((mut record, found_at)) => {
                record.found_at = DateTime::parse_from_rfc3339(&found_at)
                    .map_err(|e| {
                        StorageError::Serialization(format!(
                            "bad found_at '{}' for {}: {}",
                            found_at, identity, e
                        ))
                    })?
                    .with_timezone(&Utc);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TaskStore for SqliteStorage {
    async fn create_tasks(&self, pages: RangeInclusive<u32>) -> StorageResult<usize> {
        self.run_blocking(move |store| store.create_tasks_sync(pages))
            .await
    }

    async fn reset_orphaned_tasks(&self) -> StorageResult<u64> {
        self.run_blocking(|store| store.reset_orphaned_tasks_sync())
            .await
    }

    async fn claim_idle_tasks(&self, limit: usize) -> StorageResult<Vec<Task>> {
        self.run_blocking(move |store| store.claim_idle_tasks_sync(limit))
            .await
    }

    async fn mark_completed(&self, task_id: i64) -> StorageResult<()> {
        self.run_blocking(move |store| store.mark_completed_sync(task_id))
            .await
    }

    async fn get_task(&self, task_id: i64) -> StorageResult<Option<Task>> {
        self.run_blocking(move |store| store.get_task_sync(task_id))
            .await
    }

    async fn count_tasks(&self, status: TaskStatus) -> StorageResult<u64> {
        self.run_blocking(move |store| store.count_tasks_sync(status))
            .await
    }
}

#[async_trait]
impl RecordStore for SqliteStorage {
    async fn existing_identities(&self, identities: &[String]) -> StorageResult<HashSet<String>> {
        let identities = identities.to_vec();
        self.run_blocking(move |store| store.existing_identities_sync(&identities))
            .await
    }

    async fn insert_records(&self, records: &[Record]) -> StorageResult<InsertOutcome> {
        if records.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let records = records.to_vec();
        self.run_blocking(move |store| store.insert_records_sync(&records))
            .await
    }

    async fn count_records(&self) -> StorageResult<u64> {
        self.run_blocking(|store| store.count_records_sync()).await
    }

    async fn get_record(&self, identity: &str) -> StorageResult<Option<Record>> {
        let identity = identity.to_string();
        self.run_blocking(move |store| store.get_record_sync(&identity))
            .await
    }
}

#[async_trait]
impl StoreDump for SqliteStorage {
    async fn dump(&self, target: &Path) -> StorageResult<DumpReport> {
        let target = target.to_path_buf();
        self.run_blocking(move |store| store.dump_sync(&target)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(identity: &str) -> Record {
        Record::new(format!("https://listings.example.com/auto_{}.html", identity))
            .with_identity(identity)
    }

    #[tokio::test]
    async fn test_create_in_memory() {
        let storage = SqliteStorage::open_in_memory();
        assert!(storage.is_ok());
    }

    #[tokio::test]
    async fn test_create_tasks() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(storage.create_tasks(1..=5).await.unwrap(), 5);
        assert_eq!(storage.count_tasks(TaskStatus::Idle).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_create_tasks_twice_fails_loudly() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_tasks(1..=3).await.unwrap();

        let result = storage.create_tasks(3..=6).await;
        assert!(matches!(result, Err(StorageError::ConstraintViolation(_))));

        // the failed batch is rolled back as a whole
        assert_eq!(storage.count_tasks(TaskStatus::Idle).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_marks_in_progress() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_tasks(1..=4).await.unwrap();

        let claimed = storage.claim_idle_tasks(3).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|t| t.status() == TaskStatus::InProgress));
        assert_eq!(
            claimed.iter().map(|t| t.page_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let rest = storage.claim_idle_tasks(3).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(storage.claim_idle_tasks(3).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_claims_never_overlap() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        storage.create_tasks(1..=8).await.unwrap();

        let a = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.claim_idle_tasks(5).await.unwrap() })
        };
        let b = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.claim_idle_tasks(5).await.unwrap() })
        };

        let mut ids: Vec<i64> = a.await.unwrap().into_iter().map(|t| t.id).collect();
        ids.extend(b.await.unwrap().into_iter().map(|t| t.id));

        assert_eq!(ids.len(), 8);
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn test_reset_orphaned_tasks() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_tasks(1..=3).await.unwrap();
        let claimed = storage.claim_idle_tasks(2).await.unwrap();
        storage.mark_completed(claimed[0].id).await.unwrap();

        assert_eq!(storage.reset_orphaned_tasks().await.unwrap(), 1);
        let orphan = storage.get_task(claimed[1].id).await.unwrap().unwrap();
        assert_eq!(orphan.status(), TaskStatus::Idle);

        // second sweep is a no-op
        assert_eq!(storage.reset_orphaned_tasks().await.unwrap(), 0);
        assert_eq!(storage.count_tasks(TaskStatus::Done).await.unwrap(), 1);
        assert_eq!(storage.count_tasks(TaskStatus::Idle).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reset_on_clean_store() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(storage.reset_orphaned_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_done_is_never_reclaimed() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_tasks(1..=1).await.unwrap();
        let task = storage.claim_idle_tasks(1).await.unwrap().remove(0);

        storage.mark_completed(task.id).await.unwrap();
        // marking again is a no-op
        storage.mark_completed(task.id).await.unwrap();
        storage.reset_orphaned_tasks().await.unwrap();

        assert!(storage.claim_idle_tasks(1).await.unwrap().is_empty());
        let stored = storage.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_mark_unknown_task() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let result = storage.mark_completed(99).await;
        assert!(matches!(result, Err(StorageError::TaskNotFound(99))));
        assert!(storage.get_task(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_conflicts_counted() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        let first = storage
            .insert_records(&[record("A"), record("B")])
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome { inserted: 2, conflicts: 0 });

        let second = storage
            .insert_records(&[record("B"), record("C")])
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome { inserted: 1, conflicts: 1 });
        assert_eq!(storage.count_records().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_existing_identities() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.insert_records(&[record("A")]).await.unwrap();

        let found = storage
            .existing_identities(&["A".to_string(), "Z".to_string()])
            .await
            .unwrap();
        assert_eq!(found, HashSet::from(["A".to_string()]));
    }

    #[tokio::test]
    async fn test_get_record_roundtrip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut original = record("WVWZZZ1JZXW000001");
        original.title = Some("Volkswagen Golf 2015".to_string());
        original.price_usd = Some(9_500.0);
        original.images_count = 14;
        storage.insert_records(&[original.clone()]).await.unwrap();

        let stored = storage
            .get_record("WVWZZZ1JZXW000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.title, original.title);
        assert_eq!(stored.price_usd, Some(9_500.0));
        assert_eq!(stored.images_count, 14);
        assert_eq!(stored.found_at.timestamp(), original.found_at.timestamp());
        assert!(storage.get_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dump_copies_tasks_and_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = SqliteStorage::new(&dir.path().join("harvest.db")).unwrap();
        storage.create_tasks(1..=3).await.unwrap();
        storage
            .insert_records(&[record("A"), record("B")])
            .await
            .unwrap();

        let target = dir.path().join("dump_1.db");
        let report = storage.dump(&target).await.unwrap();
        assert_eq!(report.tasks, 3);
        assert_eq!(report.records, 2);

        let copy = SqliteStorage::new(&target).unwrap();
        assert_eq!(copy.count_tasks(TaskStatus::Idle).await.unwrap(), 3);
        assert!(copy.get_record("B").await.unwrap().is_some());

        // an existing dump is never overwritten
        let again = storage.dump(&target).await;
        assert!(matches!(again, Err(StorageError::DumpTargetExists(_))));
    }

    #[tokio::test]
    async fn test_busy_writer_does_not_stall_runtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("harvest.db");
        let storage = SqliteStorage::new(&path).unwrap();
        storage.create_tasks(1..=2).await.unwrap();

        // another process holds the write lock
        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let claim = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.claim_idle_tasks(1).await })
        };

        // the single runtime thread keeps serving timers while the claim waits
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!claim.is_finished());

        other.execute_batch("COMMIT").unwrap();
        assert_eq!(claim.await.unwrap().unwrap().len(), 1);
    }
}

//! Storage module for tasks and extracted records
//!
//! This module handles all durable state of a crawl:
//! - the task store: one task per page, with atomic claims and an orphan sweep
//! - the record store: insert-only, deduplicated by natural identity
//! - the dedup-persistence protocol layered on top of the record store
//! - timestamped dumps of the whole store
//!
//! Two backends implement the same capability set: `SqliteStorage` (relational)
//! and `MongoStorage` (document). The backend is chosen by configuration and the
//! handle is passed down explicitly.

mod mongo;
mod persist;
mod schema;
mod sqlite;
mod traits;

pub use mongo::MongoStorage;
pub use persist::{commit_results, persist, CommitReport, PersistReport};
pub use sqlite::SqliteStorage;
pub use traits::{
    DumpReport, InsertOutcome, RecordStore, Storage, StorageError, StorageResult, StoreDump,
    TaskStore,
};

use crate::config::{StorageBackend, StorageConfig};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

/// Opens the configured storage backend
///
/// # Arguments
///
/// * `config` - Storage section of the configuration
///
/// # Returns
///
/// * `Ok(Arc<dyn Storage>)` - A shareable store handle
/// * `Err(StorageError)` - Failed to open or connect
pub async fn open_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Relational => {
            tracing::info!("Opening SQLite store at {}", config.database_path);
            let storage = SqliteStorage::new(Path::new(&config.database_path))?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Document => {
            tracing::info!("Connecting to MongoDB database {}", config.mongo_database);
            let storage = MongoStorage::connect(&config.mongo_uri, &config.mongo_database).await?;
            Ok(Arc::new(storage))
        }
    }
}

/// Dump file name for a backend, stamped with the time of the dump
///
/// Relational dumps are SQLite files, document dumps are JSON lines.
pub fn dump_file_name(backend: StorageBackend, at: DateTime<Utc>) -> String {
    let extension = match backend {
        StorageBackend::Relational => "db",
        StorageBackend::Document => "jsonl",
    };
    format!("dump_{}.{}", at.format("%Y_%m_%d_%H_%M_%S"), extension)
}

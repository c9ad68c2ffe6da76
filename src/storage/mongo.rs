//! MongoDB storage implementation
//!
//! Document backend for the task and record stores. Tasks carry integer ids
//! reserved from a `counters` collection so they stay interchangeable with
//! the relational backend's ids on the wire.

use crate::model::{Record, Task, TaskStatus};
use crate::storage::traits::{
    DumpReport, InsertOutcome, RecordStore, StorageError, StorageResult, StoreDump, TaskStore,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions, IndexOptions,
    InsertManyOptions, ReturnDocument,
};
use mongodb::{Client, Collection, Database, IndexModel};
use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::ops::RangeInclusive;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

const TASKS: &str = "tasks";
const RECORDS: &str = "records";
const COUNTERS: &str = "counters";

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB storage backend
pub struct MongoStorage {
    database: Database,
}

impl MongoStorage {
    /// Connects to MongoDB and makes sure the unique indexes exist
    ///
    /// # Arguments
    ///
    /// * `uri` - MongoDB connection string
    /// * `database` - Database name
    pub async fn connect(uri: &str, database: &str) -> StorageResult<Self> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;
        let storage = Self {
            database: client.database(database),
        };
        storage.ensure_indexes().await?;

        tracing::debug!("Connected to MongoDB database: {}", database);
        Ok(storage)
    }

    async fn ensure_indexes(&self) -> StorageResult<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.tasks()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "page_number": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;
        self.tasks()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "completed": 1, "in_work": 1, "page_number": 1 })
                    .build(),
                None,
            )
            .await?;
        self.records()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "identity": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;

        Ok(())
    }

    fn tasks(&self) -> Collection<Document> {
        self.database.collection(TASKS)
    }

    fn records(&self) -> Collection<Document> {
        self.database.collection(RECORDS)
    }

    fn counters(&self) -> Collection<Document> {
        self.database.collection(COUNTERS)
    }

    /// Reserves `count` consecutive task ids and returns the first one
    async fn reserve_task_ids(&self, count: i64) -> StorageResult<i64> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let counter = self
            .counters()
            .find_one_and_update(doc! { "_id": TASKS }, doc! { "$inc": { "seq": count } }, options)
            .await?
            .ok_or_else(|| StorageError::Serialization("task id counter missing".to_string()))?;

        let last = counter.get_i64("seq").map_err(bson_error)?;
        Ok(last - count + 1)
    }
}

/// One line of a dump file: the collection name and the document as relaxed extended JSON
fn dump_line(collection: &str, document: Document) -> String {
    let line = serde_json::json!({
        "collection": collection,
        "document": Bson::Document(document).into_relaxed_extjson(),
    });
    format!("{}\n", line)
}

fn bson_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Serialization(format!("BSON: {}", e))
}

fn status_filter(status: TaskStatus) -> Document {
    match status {
        TaskStatus::Idle => doc! { "in_work": false, "completed": false },
        TaskStatus::InProgress => doc! { "in_work": true, "completed": false },
        TaskStatus::Done => doc! { "completed": true },
    }
}

fn task_from_document(document: &Document) -> StorageResult<Task> {
    Ok(Task {
        id: document.get_i64("_id").map_err(bson_error)?,
        page_number: u32::try_from(document.get_i64("page_number").map_err(bson_error)?)
            .map_err(bson_error)?,
        in_work: document.get_bool("in_work").map_err(bson_error)?,
        completed: document.get_bool("completed").map_err(bson_error)?,
    })
}

fn record_to_document(record: &Record) -> Document {
    doc! {
        "identity": record.identity_key(),
        "url": record.url.as_str(),
        "title": record.title.as_deref(),
        "price_usd": record.price_usd,
        "odometer": record.odometer,
        "seller_name": record.seller_name.as_deref(),
        "phone_number": record.phone_number.as_deref(),
        "image_url": record.image_url.as_deref(),
        "images_count": i64::from(record.images_count),
        "plate_number": record.plate_number.as_deref(),
        "found_at": bson::DateTime::from_millis(record.found_at.timestamp_millis()),
    }
}

fn optional_str(document: &Document, key: &str) -> Option<String> {
    document.get_str(key).ok().map(str::to_string)
}

fn record_from_document(document: &Document) -> StorageResult<Record> {
    let found_at_ms = document
        .get_datetime("found_at")
        .map_err(bson_error)?
        .timestamp_millis();
    let found_at = Utc
        .timestamp_millis_opt(found_at_ms)
        .single()
        .ok_or_else(|| bson_error(format!("found_at out of range: {}", found_at_ms)))?;

    Ok(Record {
        identity: optional_str(document, "identity"),
        url: document.get_str("url").map_err(bson_error)?.to_string(),
        title: optional_str(document, "title"),
        price_usd: document.get_f64("price_usd").ok(),
        odometer: document.get_f64("odometer").ok(),
        seller_name: optional_str(document, "seller_name"),
        phone_number: optional_str(document, "phone_number"),
        image_url: optional_str(document, "image_url"),
        images_count: u32::try_from(document.get_i64("images_count").unwrap_or(0))
            .unwrap_or(0),
        plate_number: optional_str(document, "plate_number"),
        found_at,
    })
}

#[async_trait]
impl TaskStore for MongoStorage {
    async fn create_tasks(&self, pages: RangeInclusive<u32>) -> StorageResult<usize> {
        let (first, last) = (*pages.start(), *pages.end());
        if first > last {
            return Ok(0);
        }

        let clashing = self
            .tasks()
            .count_documents(
                doc! { "page_number": { "$gte": i64::from(first), "$lte": i64::from(last) } },
                None,
            )
            .await?;
        if clashing > 0 {
            return Err(StorageError::ConstraintViolation(format!(
                "{} tasks already exist in pages {}..={}",
                clashing, first, last
            )));
        }

        let count = i64::from(last - first) + 1;
        let first_id = self.reserve_task_ids(count).await?;
        let documents: Vec<Document> = pages
            .enumerate()
            .map(|(offset, page)| {
                doc! {
                    "_id": first_id + offset as i64,
                    "page_number": i64::from(page),
                    "in_work": false,
                    "completed": false,
                }
            })
            .collect();

        match self.tasks().insert_many(documents, None).await {
            Ok(inserted) => Ok(inserted.inserted_ids.len()),
            Err(e) if is_duplicate_key(&e) => Err(StorageError::ConstraintViolation(format!(
                "tasks for pages {}..={} raced with another seeder",
                first, last
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn reset_orphaned_tasks(&self) -> StorageResult<u64> {
        let result = self
            .tasks()
            .update_many(
                status_filter(TaskStatus::InProgress),
                doc! { "$set": { "in_work": false } },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn claim_idle_tasks(&self, limit: usize) -> StorageResult<Vec<Task>> {
        let mut claimed = Vec::with_capacity(limit);

        // Each find_one_and_update is atomic on its document, so two claimers
        // can interleave but never receive the same task
        while claimed.len() < limit {
            let options = FindOneAndUpdateOptions::builder()
                .sort(doc! { "page_number": 1 })
                .return_document(ReturnDocument::After)
                .build();
            let next = self
                .tasks()
                .find_one_and_update(
                    status_filter(TaskStatus::Idle),
                    doc! { "$set": { "in_work": true } },
                    options,
                )
                .await?;

            match next {
                Some(document) => claimed.push(task_from_document(&document)?),
                None => break,
            }
        }

        Ok(claimed)
    }

    async fn mark_completed(&self, task_id: i64) -> StorageResult<()> {
        let result = self
            .tasks()
            .update_one(
                doc! { "_id": task_id },
                doc! { "$set": { "completed": true } },
                None,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(StorageError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn get_task(&self, task_id: i64) -> StorageResult<Option<Task>> {
        self.tasks()
            .find_one(doc! { "_id": task_id }, None)
            .await?
            .map(|document| task_from_document(&document))
            .transpose()
    }

    async fn count_tasks(&self, status: TaskStatus) -> StorageResult<u64> {
        Ok(self
            .tasks()
            .count_documents(status_filter(status), None)
            .await?)
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match error.kind.as_ref() {
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .map(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY))
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl RecordStore for MongoStorage {
    async fn existing_identities(&self, identities: &[String]) -> StorageResult<HashSet<String>> {
        if identities.is_empty() {
            return Ok(HashSet::new());
        }

        let options = FindOptions::builder()
            .projection(doc! { "identity": 1, "_id": 0 })
            .build();
        let mut cursor = self
            .records()
            .find(doc! { "identity": { "$in": identities.to_vec() } }, options)
            .await?;

        let mut found = HashSet::new();
        while let Some(document) = cursor.try_next().await? {
            if let Ok(identity) = document.get_str("identity") {
                found.insert(identity.to_string());
            }
        }
        Ok(found)
    }

    async fn insert_records(&self, records: &[Record]) -> StorageResult<InsertOutcome> {
        if records.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let documents: Vec<Document> = records.iter().map(record_to_document).collect();
        let options = InsertManyOptions::builder().ordered(false).build();

        match self.records().insert_many(documents, options).await {
            Ok(result) => Ok(InsertOutcome {
                inserted: result.inserted_ids.len(),
                conflicts: 0,
            }),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::BulkWrite(failure) if failure.write_concern_error.is_none() => {
                    let errors = failure.write_errors.as_deref().unwrap_or_default();
                    // Only lost unique-index races are expected; anything else fails the batch
                    if errors.iter().all(|w| w.code == DUPLICATE_KEY) {
                        Ok(InsertOutcome {
                            inserted: records.len() - errors.len(),
                            conflicts: errors.len(),
                        })
                    } else {
                        Err(e.into())
                    }
                }
                _ => Err(e.into()),
            },
        }
    }

    async fn count_records(&self) -> StorageResult<u64> {
        Ok(self.records().count_documents(doc! {}, None).await?)
    }

    async fn get_record(&self, identity: &str) -> StorageResult<Option<Record>> {
        let options = FindOneOptions::builder()
            .projection(doc! { "_id": 0 })
            .build();
        self.records()
            .find_one(doc! { "identity": identity }, options)
            .await?
            .map(|document| record_from_document(&document))
            .transpose()
    }
}

impl MongoStorage {
    async fn dump_collection(&self, name: &str, out: &mut BufWriter<File>) -> StorageResult<u64> {
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let mut cursor = self
            .database
            .collection::<Document>(name)
            .find(doc! {}, options)
            .await?;

        let mut written = 0;
        while let Some(document) = cursor.try_next().await? {
            out.write_all(dump_line(name, document).as_bytes()).await?;
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait]
impl StoreDump for MongoStorage {
    /// Writes the `tasks` then `records` collections as JSON lines
    async fn dump(&self, target: &Path) -> StorageResult<DumpReport> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .await
            .map_err(|e| match e.kind() {
                IoErrorKind::AlreadyExists => StorageError::DumpTargetExists(target.to_path_buf()),
                _ => StorageError::Io(e),
            })?;
        let mut out = BufWriter::new(file);

        let tasks = self.dump_collection(TASKS, &mut out).await?;
        let records = self.dump_collection(RECORDS, &mut out).await?;
        out.flush().await?;

        Ok(DumpReport {
            path: target.to_path_buf(),
            tasks,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_filters() {
        assert_eq!(
            status_filter(TaskStatus::Idle),
            doc! { "in_work": false, "completed": false }
        );
        assert_eq!(status_filter(TaskStatus::Done), doc! { "completed": true });
    }

    #[test]
    fn test_record_document_roundtrip() {
        let mut record = Record::new("https://listings.example.com/auto_1.html")
            .with_identity(" VIN123 ");
        record.price_usd = Some(12_000.0);
        record.images_count = 9;

        let document = record_to_document(&record);
        assert_eq!(document.get_str("identity").unwrap(), "VIN123");
        assert_eq!(document.get("title"), Some(&Bson::Null));

        let back = record_from_document(&document).unwrap();
        assert_eq!(back.identity.as_deref(), Some("VIN123"));
        assert_eq!(back.title, None);
        assert_eq!(back.price_usd, Some(12_000.0));
        assert_eq!(back.odometer, None);
        assert_eq!(back.images_count, 9);
        assert_eq!(
            back.found_at.timestamp_millis(),
            record.found_at.timestamp_millis()
        );
    }

    #[test]
    fn test_task_from_document() {
        let document = doc! { "_id": 4_i64, "page_number": 17_i64, "in_work": true, "completed": false };
        let task = task_from_document(&document).unwrap();
        assert_eq!(task.id, 4);
        assert_eq!(task.page_number, 17);
        assert_eq!(task.status(), TaskStatus::InProgress);

        assert!(task_from_document(&doc! { "_id": 1_i64 }).is_err());
    }

    #[test]
    fn test_dump_line() {
        let line = dump_line(
            TASKS,
            doc! { "_id": 4_i64, "page_number": 4_i64, "in_work": false, "completed": true },
        );
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["collection"], "tasks");
        assert_eq!(value["document"]["page_number"], 4);
        assert_eq!(value["document"]["completed"], true);
    }
}

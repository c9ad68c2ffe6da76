//! Listing-Harvest: a crash-recoverable crawler for paginated listing sites
//!
//! This crate crawls a paginated listing site page by page and persists the extracted
//! records while avoiding duplicate work and duplicate storage. Pages are tracked as
//! tasks in a durable task store, processed under a bounded worker pool, and their
//! records are written through an insert-only, identity-deduplicating persistence path.
//!
//! Two run shapes share the same building blocks:
//! - **embedded**: one process claims tasks, fetches pages and commits results
//! - **distributed**: an orchestrator hands tasks to workers over a list-structured broker

pub mod config;
pub mod crawler;
pub mod model;
pub mod output;
pub mod queue;
pub mod storage;

use thiserror::Error;

/// Main error type for Listing-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Worker pool is no longer accepting work")]
    PoolClosed,

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid CSS selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },
}

/// Result type alias for Listing-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use model::{Record, Task, TaskResult, TaskStatus};

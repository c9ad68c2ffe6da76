//! Crawler module: fetching, extraction and the run modes built on them
//!
//! This module contains:
//! - HTTP fetching with the transient-retry policy
//! - listing and detail page extraction
//! - the bounded worker pool that runs page-processing units
//! - the embedded, orchestrator, worker and local run modes

mod embedded;
mod extractor;
mod fetcher;
mod local;
mod orchestrator;
mod pool;
mod processor;
mod worker;

pub use embedded::{run_embedded, seed_if_empty, CommitDrain, EmbeddedReport};
pub use extractor::{parse_odometer, parse_price, ExtractError, ListingExtractor, PageExtractor};
pub use fetcher::{
    build_http_client, FetchError, FetchedPage, HttpFetcher, PageCondition, PageFetcher,
    PageInspector, PageKind, RetryPolicy, RetryingFetcher,
};
pub use local::run_local;
pub use orchestrator::{Orchestrator, OrchestratorOptions, OrchestratorReport, Phase};
pub use pool::{Drain, DrainStats, PoolOptions, WorkerPool};
pub use processor::PageProcessor;
pub use worker::{run_worker, PublishDrain, WorkerOptions, WorkerReport};

use crate::config::Config;
use crate::storage::open_storage;
use crate::HarvestError;
use tokio_util::sync::CancellationToken;

/// Runs a complete embedded crawl from configuration
///
/// This is the main entry point for a single-process crawl. It will:
/// 1. Open the configured storage backend
/// 2. Build the fetcher and extractor
/// 3. Sweep orphans, seed an empty store and process pages until the listings run out
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `cancel` - Stops claiming new pages
///
/// # Returns
///
/// * `Ok(EmbeddedReport)` - Crawl completed or was cancelled cleanly
/// * `Err(HarvestError)` - Crawl failed
pub async fn crawl(config: &Config, cancel: CancellationToken) -> Result<EmbeddedReport, HarvestError> {
    let storage = open_storage(&config.storage).await?;
    let processor = PageProcessor::from_config(config)?;
    run_embedded(storage, processor, &config.crawler, true, cancel).await
}

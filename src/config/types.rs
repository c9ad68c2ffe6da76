use serde::Deserialize;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Main configuration structure for Listing-Harvest
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

/// Crawl range and embedded worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Listing root; page `n` is fetched from `<base-url>?page=n`
    pub base_url: String,

    /// First page number to crawl (1-based)
    #[serde(default = "default_first_page")]
    pub first_page: u32,

    /// Last page number to crawl, inclusive
    pub last_page: u32,

    /// Maximum number of page-processing units running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How often a saturated pool re-checks for a free slot (milliseconds)
    #[serde(default = "default_submit_poll_ms")]
    pub submit_poll_ms: u64,

    /// How often the results buffer is drained (milliseconds)
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl CrawlerConfig {
    /// Page numbers covered by this crawl
    pub fn page_range(&self) -> RangeInclusive<u32> {
        self.first_page..=self.last_page
    }

    pub fn submit_poll(&self) -> Duration {
        Duration::from_millis(self.submit_poll_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Page fetch retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    /// Per-request timeout; a timeout counts as a transient transport failure
    pub request_timeout_secs: u64,

    /// Delay before retrying after a transport failure (milliseconds)
    pub retry_delay_ms: u64,

    /// Delay before re-fetching a page that loaded without its landmarks (milliseconds)
    pub incomplete_delay_ms: u64,

    /// Attempt cap per page; 0 retries forever
    pub max_attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            retry_delay_ms: 100,
            incomplete_delay_ms: 1000,
            max_attempts: 0,
        }
    }
}

/// Which store implementation backs the task and record tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite database file
    Relational,
    /// MongoDB database
    Document,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Path to the SQLite database file (relational backend)
    #[serde(default)]
    pub database_path: String,

    /// MongoDB connection string (document backend)
    #[serde(default)]
    pub mongo_uri: String,

    /// MongoDB database name (document backend)
    #[serde(default)]
    pub mongo_database: String,
}

/// Which broker carries task and result envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redis,
    /// In-process only; usable by the `local` run mode
    Memory,
}

/// Work queue and distributed-mode configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: String,
    pub task_channel: String,
    pub result_channel: String,

    /// Sleep between pops on an empty channel (milliseconds)
    pub poll_interval_ms: u64,

    /// Number of idle tasks the orchestrator claims per dispatch round
    pub dispatch_batch: usize,

    /// Sleep between orchestrator dispatch rounds (milliseconds)
    pub dispatch_interval_ms: u64,

    /// How long the orchestrator keeps waiting for results once no tasks are left (milliseconds)
    pub drain_grace_ms: u64,

    /// Worker pool size; browser-backed fetching wants this small
    pub worker_concurrency: usize,

    /// Worker exits after this long without a task (milliseconds); runs forever when unset
    pub worker_idle_exit_ms: Option<u64>,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn worker_idle_exit(&self) -> Option<Duration> {
        self.worker_idle_exit_ms.map(Duration::from_millis)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Redis,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            task_channel: "tasks_queue".to_string(),
            result_channel: "results_queue".to_string(),
            poll_interval_ms: 5000,
            dispatch_batch: 10,
            dispatch_interval_ms: 15000,
            drain_grace_ms: 60000,
            worker_concurrency: 2,
            worker_idle_exit_ms: None,
        }
    }
}

/// CSS selectors used by the bundled listing extractor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SelectorConfig {
    /// Landmark present on every fully rendered page
    pub page_header: String,
    /// Second landmark, rendered last
    pub page_footer: String,
    /// One element per listing on a listing page
    pub listing_item: String,
    /// Anchor to a listing's detail page
    pub listing_link: String,
    pub sold_marker: String,
    pub title: String,
    pub price: String,
    pub odometer: String,
    /// Tried in order; the first non-empty match wins
    pub seller_name: Vec<String>,
    pub phone_number: String,
    pub image: String,
    pub images_count: String,
    pub plate_number: String,
    /// Tried in order; the first non-empty match wins
    pub identity: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            page_header: ".app-head".to_string(),
            page_footer: ".footer-line-wrap".to_string(),
            listing_item: ".ticket-item".to_string(),
            listing_link: ".content-bar a.m-link-ticket".to_string(),
            sold_marker: ".sold-out".to_string(),
            title: "h1.head".to_string(),
            price: ".price_value strong".to_string(),
            odometer: ".base-information span".to_string(),
            seller_name: vec![
                ".seller_info_name a".to_string(),
                ".seller_info_name".to_string(),
            ],
            phone_number: ".phone".to_string(),
            image: ".carousel-inner source".to_string(),
            images_count: ".count .mhide".to_string(),
            plate_number: ".state-num".to_string(),
            identity: vec![".label-vin".to_string(), ".vin-code".to_string()],
        }
    }
}

fn default_first_page() -> u32 {
    1
}

fn default_max_concurrency() -> usize {
    20
}

fn default_submit_poll_ms() -> u64 {
    10
}

fn default_drain_interval_ms() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("listing-harvest/{}", env!("CARGO_PKG_VERSION"))
}

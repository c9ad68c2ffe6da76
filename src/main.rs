//! Listing-Harvest main entry point
//!
//! This is the command-line interface for the Listing-Harvest crawler.

use anyhow::Context;
use clap::{Parser, Subcommand};
use listing_harvest::config::{load_config_with_hash, Config, QueueBackend, StorageBackend};
use listing_harvest::crawler::{
    crawl, run_local, run_worker, seed_if_empty, Orchestrator, OrchestratorOptions,
    PageProcessor, WorkerOptions,
};
use listing_harvest::output::{load_statistics, print_statistics};
use listing_harvest::queue::{open_broker, WorkQueue};
use listing_harvest::storage::{dump_file_name, open_storage, Storage, StoreDump, TaskStore};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Listing-Harvest: a crash-recoverable listing crawler
///
/// Listing-Harvest crawls a paginated listing site page by page, extracts one
/// record per listing and stores each record at most once. Runs either in a
/// single process or as an orchestrator with workers over a Redis queue.
#[derive(Parser, Debug)]
#[command(name = "listing-harvest")]
#[command(version)]
#[command(about = "A crash-recoverable listing crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(
        short,
        long,
        value_name = "CONFIG",
        default_value = "harvest.toml",
        global = true
    )]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl in this process: claim pages, fetch them and store records
    Crawl,

    /// Hand tasks to workers over the queue and commit their results
    Orchestrate {
        /// Create tasks for the configured page range if the store has none
        #[arg(long)]
        seed_tasks: bool,
    },

    /// Take tasks from the queue and publish their results
    Work,

    /// Run an orchestrator and workers together in this process
    Local {
        /// Number of in-process workers
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },

    /// Create one task per page in the configured range
    Seed,

    /// Show task progress and record counts from the store
    Stats,

    /// Write a timestamped copy of the whole store
    Dump {
        /// Directory that receives the dump file
        #[arg(long, value_name = "DIR", default_value = "dumps")]
        dir: PathBuf,
    },

    /// Validate configuration and show what would be crawled
    DryRun,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    match cli.command {
        Command::Crawl => handle_crawl(&config).await,
        Command::Orchestrate { seed_tasks } => handle_orchestrate(&config, seed_tasks).await,
        Command::Work => handle_work(&config).await,
        Command::Local { workers } => handle_local(&config, workers).await,
        Command::Seed => handle_seed(&config).await,
        Command::Stats => handle_stats(&config).await,
        Command::Dump { dir } => handle_dump(&config, &dir).await,
        Command::DryRun => {
            handle_dry_run(&config);
            Ok(())
        }
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("listing_harvest=info,warn"),
            1 => EnvFilter::new("listing_harvest=debug,info"),
            2 => EnvFilter::new("listing_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing pages already in progress");
            trigger.cancel();
        }
    });
    token
}

async fn open_store(config: &Config) -> anyhow::Result<std::sync::Arc<dyn Storage>> {
    open_storage(&config.storage)
        .await
        .with_context(|| format!("Failed to open {:?} storage", config.storage.backend))
}

async fn open_queue(config: &Config) -> anyhow::Result<WorkQueue> {
    let broker = open_broker(&config.queue)
        .await
        .with_context(|| format!("Failed to connect to queue at {}", config.queue.redis_url))?;
    Ok(WorkQueue::new(broker, &config.queue))
}

/// Prints the store's statistics after a run
async fn report_store(storage: &dyn Storage) -> anyhow::Result<()> {
    let stats = load_statistics(storage)
        .await
        .context("Failed to load statistics")?;
    println!();
    print_statistics(&stats);
    Ok(())
}

/// Handles `crawl`: the embedded single-process run
async fn handle_crawl(config: &Config) -> anyhow::Result<()> {
    tracing::info!(
        "Starting embedded crawl of pages {}..={} (max concurrency {})",
        config.crawler.first_page,
        config.crawler.last_page,
        config.crawler.max_concurrency
    );

    let report = crawl(config, cancel_on_ctrl_c())
        .await
        .context("Crawl failed")?;
    if report.exhausted {
        tracing::info!("Reached the end of the listings");
    }

    report_store(open_store(config).await?.as_ref()).await
}

/// Handles `orchestrate`: dispatches tasks and commits results until the run is done
async fn handle_orchestrate(config: &Config, seed_tasks: bool) -> anyhow::Result<()> {
    if config.queue.backend == QueueBackend::Memory {
        tracing::warn!("In-memory queue is not shared with worker processes; use `local` instead");
    }

    let storage = open_store(config).await?;
    if seed_tasks {
        seed_if_empty(storage.as_ref(), config.crawler.page_range())
            .await
            .context("Failed to seed tasks")?;
    }
    let queue = open_queue(config).await?;

    let mut orchestrator = Orchestrator::new(
        storage.clone(),
        queue,
        OrchestratorOptions::from(&config.queue),
    );
    orchestrator
        .run(&cancel_on_ctrl_c())
        .await
        .context("Orchestrator failed")?;

    report_store(storage.as_ref()).await
}

/// Handles `work`: processes queue tasks until interrupted or idle
async fn handle_work(config: &Config) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let processor = PageProcessor::from_config(config).context("Failed to build page processor")?;

    let report = run_worker(
        queue,
        processor,
        WorkerOptions::from_config(config),
        cancel_on_ctrl_c(),
    )
    .await
    .context("Worker failed")?;

    println!(
        "Worker done: {} tasks taken, {} results published",
        report.tasks_taken, report.published.items
    );
    Ok(())
}

/// Handles `local`: orchestrator and workers over an in-memory queue
async fn handle_local(config: &Config, workers: usize) -> anyhow::Result<()> {
    let storage = open_store(config).await?;
    seed_if_empty(storage.as_ref(), config.crawler.page_range())
        .await
        .context("Failed to seed tasks")?;
    let processor = PageProcessor::from_config(config).context("Failed to build page processor")?;

    run_local(
        storage.clone(),
        processor,
        config,
        workers,
        cancel_on_ctrl_c(),
    )
    .await
    .context("Local run failed")?;

    report_store(storage.as_ref()).await
}

/// Handles `seed`: creates the tasks for the configured range
async fn handle_seed(config: &Config) -> anyhow::Result<()> {
    let storage = open_store(config).await?;
    let range = config.crawler.page_range();
    let created = storage
        .create_tasks(range.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to create tasks for pages {}..={}",
                range.start(),
                range.end()
            )
        })?;

    println!("Created {} tasks", created);
    Ok(())
}

/// Handles `stats`: shows statistics from the store
async fn handle_stats(config: &Config) -> anyhow::Result<()> {
    let storage = open_store(config).await?;
    let stats = load_statistics(storage.as_ref())
        .await
        .context("Failed to load statistics")?;
    print_statistics(&stats);
    Ok(())
}

/// Handles `dump`: writes the store to a new timestamped file under `dir`
async fn handle_dump(config: &Config, dir: &std::path::Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create dump directory {}", dir.display()))?;
    let target = dir.join(dump_file_name(config.storage.backend, chrono::Utc::now()));

    let storage = open_store(config).await?;
    let report = storage
        .dump(&target)
        .await
        .with_context(|| format!("Failed to dump store to {}", target.display()))?;

    tracing::info!("Dump written to {}", report.path.display());
    println!(
        "Dumped {} tasks and {} records to {}",
        report.tasks,
        report.records,
        report.path.display()
    );
    Ok(())
}

/// Handles `dry-run`: shows the validated configuration
fn handle_dry_run(config: &Config) {
    println!("=== Listing-Harvest Dry Run ===\n");

    println!("Crawler:");
    println!("  Base URL: {}", config.crawler.base_url);
    println!(
        "  Pages: {}..={} ({} tasks)",
        config.crawler.first_page,
        config.crawler.last_page,
        config.crawler.page_range().count()
    );
    println!("  Max concurrency: {}", config.crawler.max_concurrency);
    println!("  User agent: {}", config.crawler.user_agent);

    println!("\nFetch:");
    println!("  Request timeout: {}s", config.fetch.request_timeout_secs);
    println!("  Retry delay: {}ms", config.fetch.retry_delay_ms);
    println!("  Incomplete page delay: {}ms", config.fetch.incomplete_delay_ms);
    if config.fetch.max_attempts == 0 {
        println!("  Attempts: unlimited");
    } else {
        println!("  Attempts: {}", config.fetch.max_attempts);
    }

    println!("\nStorage:");
    println!("  Backend: {:?}", config.storage.backend);
    match config.storage.backend {
        StorageBackend::Relational => {
            println!("  Database: {}", config.storage.database_path)
        }
        StorageBackend::Document => println!(
            "  Database: {} at {}",
            config.storage.mongo_database, config.storage.mongo_uri
        ),
    }

    println!("\nQueue:");
    println!("  Backend: {:?}", config.queue.backend);
    println!("  Redis: {}", config.queue.redis_url);
    println!(
        "  Channels: {} / {}",
        config.queue.task_channel, config.queue.result_channel
    );
    println!("  Worker pool size: {}", config.queue.worker_concurrency);

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would crawl {} listing pages from {}",
        config.crawler.page_range().count(),
        config.crawler.base_url
    );
}

//! Integration tests for the crawler
//!
//! These tests use wiremock to serve a small listing site and run the
//! embedded and local (orchestrator plus workers) modes end-to-end against
//! a SQLite store in a temporary directory.

use listing_harvest::config::{parse_config, Config};
use listing_harvest::crawler::{crawl, run_local, seed_if_empty, PageProcessor};
use listing_harvest::model::TaskStatus;
use listing_harvest::config::StorageBackend;
use listing_harvest::storage::{
    dump_file_name, open_storage, RecordStore, SqliteStorage, Storage, StoreDump, TaskStore,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Wraps page content in the landmarks of a fully rendered page
fn rendered(inner: &str) -> String {
    format!(
        r#"<html><body>
        <header class="app-head"></header>
        {}
        <div class="footer-line-wrap"></div>
        </body></html>"#,
        inner
    )
}

fn listing_page(links: &[&str]) -> String {
    let items: String = links
        .iter()
        .map(|link| {
            format!(
                r#"<div class="ticket-item "><div class="content-bar"><a class="m-link-ticket" href="{}"></a></div></div>"#,
                link
            )
        })
        .collect();
    rendered(&items)
}

fn detail_page(vin: &str, price: &str) -> String {
    rendered(&format!(
        r#"<h1 class="head" title="Listing {vin}">Listing {vin}</h1>
        <div class="price_value"><strong>{price}</strong></div>
        <div class="seller_info_name"><a>Dealer</a></div>
        <span class="label-vin">{vin}</span>"#,
        vin = vin,
        price = price
    ))
}

/// Serves pages 1-3 with two listings each; VIN-B appears on pages 1 and 2.
/// Every other page has no listings.
async fn mount_site(server: &MockServer) {
    let pages = [
        ("1", ["/auto/a1.html", "/auto/a2.html"]),
        ("2", ["/auto/b1.html", "/auto/b2.html"]),
        ("3", ["/auto/c1.html", "/auto/c2.html"]),
    ];
    for (page, links) in pages {
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("page", page))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(&links)))
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rendered("<p>No results</p>")))
        .with_priority(10)
        .mount(server)
        .await;

    let details = [
        ("/auto/a1.html", "VIN-A", "12 500 $"),
        ("/auto/a2.html", "VIN-B", "8 000 $"),
        ("/auto/b1.html", "VIN-C", "9 900 $"),
        ("/auto/b2.html", "VIN-B", "8 000 $"),
        ("/auto/c1.html", "VIN-D", "15 000 $"),
        ("/auto/c2.html", "VIN-E", "4 200 $"),
    ];
    for (detail_path, vin, price) in details {
        Mock::given(method("GET"))
            .and(path(detail_path))
            .respond_with(ResponseTemplate::new(200).set_body_string(detail_page(vin, price)))
            .mount(server)
            .await;
    }
}

/// Creates a test configuration pointing at the mock site
fn create_test_config(server: &MockServer, db_path: &Path, last_page: u32) -> Config {
    parse_config(&format!(
        r#"
[crawler]
base-url = "{uri}/search"
first-page = 1
last-page = {last_page}
max-concurrency = 2
submit-poll-ms = 1
drain-interval-ms = 5
user-agent = "TestHarvester/1.0"

[fetch]
request-timeout-secs = 5
retry-delay-ms = 1
incomplete-delay-ms = 1
max-attempts = 5

[storage]
backend = "relational"
database-path = "{db}"

[queue]
backend = "memory"
poll-interval-ms = 2
dispatch-batch = 2
dispatch-interval-ms = 5
drain-grace-ms = 100
worker-concurrency = 2
"#,
        uri = server.uri(),
        last_page = last_page,
        db = db_path.display()
    ))
    .expect("Test config should be valid")
}

async fn count(storage: &dyn Storage, status: TaskStatus) -> u64 {
    storage.count_tasks(status).await.unwrap()
}

#[tokio::test]
async fn test_embedded_crawl_collapses_duplicates() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&server, &dir.path().join("harvest.db"), 3);

    let report = crawl(&config, CancellationToken::new()).await.unwrap();
    assert_eq!(report.dispatched, 3);
    assert_eq!(report.drained.items, 3);

    let storage = open_storage(&config.storage).await.unwrap();
    assert_eq!(storage.count_records().await.unwrap(), 5);
    assert_eq!(count(storage.as_ref(), TaskStatus::Done).await, 3);
    assert_eq!(count(storage.as_ref(), TaskStatus::Idle).await, 0);

    let record = storage.get_record("VIN-A").await.unwrap().unwrap();
    assert_eq!(record.price_usd, Some(12500.0));
    assert!(record.url.ends_with("/auto/a1.html"));
}

#[tokio::test]
async fn test_second_run_adds_nothing() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&server, &dir.path().join("harvest.db"), 3);

    crawl(&config, CancellationToken::new()).await.unwrap();
    let second = crawl(&config, CancellationToken::new()).await.unwrap();

    assert_eq!(second.dispatched, 0);
    let storage = open_storage(&config.storage).await.unwrap();
    assert_eq!(storage.count_records().await.unwrap(), 5);
}

#[tokio::test]
async fn test_crawl_recovers_orphaned_tasks() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&server, &dir.path().join("harvest.db"), 3);

    // a crashed run left two pages claimed
    {
        let storage = open_storage(&config.storage).await.unwrap();
        seed_if_empty(storage.as_ref(), config.crawler.page_range())
            .await
            .unwrap();
        assert_eq!(storage.claim_idle_tasks(2).await.unwrap().len(), 2);
        assert_eq!(count(storage.as_ref(), TaskStatus::InProgress).await, 2);
    }

    let report = crawl(&config, CancellationToken::new()).await.unwrap();
    assert_eq!(report.orphans_reset, 2);

    let storage = open_storage(&config.storage).await.unwrap();
    assert_eq!(count(storage.as_ref(), TaskStatus::Done).await, 3);
    assert_eq!(storage.count_records().await.unwrap(), 5);
}

#[tokio::test]
async fn test_crawl_stops_at_end_of_listings() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&server, &dir.path().join("harvest.db"), 8);

    let report = crawl(&config, CancellationToken::new()).await.unwrap();
    assert!(report.exhausted);
    assert!(report.dispatched < 8);

    let storage = open_storage(&config.storage).await.unwrap();
    assert_eq!(storage.count_records().await.unwrap(), 5);
    assert!(count(storage.as_ref(), TaskStatus::Done).await >= 4);
    assert!(count(storage.as_ref(), TaskStatus::Idle).await > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_cluster_crawl() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&server, &dir.path().join("harvest.db"), 3);

    let storage: Arc<dyn Storage> = open_storage(&config.storage).await.unwrap();
    seed_if_empty(storage.as_ref(), config.crawler.page_range())
        .await
        .unwrap();
    let processor = PageProcessor::from_config(&config).unwrap();

    let (report, workers) = run_local(
        Arc::clone(&storage),
        processor,
        &config,
        2,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(workers.len(), 2);
    assert_eq!(workers.iter().map(|w| w.tasks_taken).sum::<usize>(), 3);
    assert_eq!(report.dispatched, 3);
    assert!(report.unresolved.is_empty());
    assert_eq!(report.committed.completed, 3);
    assert_eq!(report.committed.records.inserted, 5);
    assert_eq!(report.committed.records.duplicates, 1);

    assert_eq!(storage.count_records().await.unwrap(), 5);
    assert_eq!(count(storage.as_ref(), TaskStatus::Done).await, 3);
}

#[tokio::test]
async fn test_dump_after_crawl() {
    let server = MockServer::start().await;
    mount_site(&server).await;
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&server, &dir.path().join("harvest.db"), 3);
    crawl(&config, CancellationToken::new()).await.unwrap();

    let storage = open_storage(&config.storage).await.unwrap();
    let target = dir
        .path()
        .join(dump_file_name(StorageBackend::Relational, chrono::Utc::now()));
    let report = storage.dump(&target).await.unwrap();
    assert_eq!(report.tasks, 3);
    assert_eq!(report.records, 5);

    let copy = SqliteStorage::new(&target).unwrap();
    assert_eq!(copy.count_records().await.unwrap(), 5);
    assert_eq!(copy.count_tasks(TaskStatus::Done).await.unwrap(), 3);
}

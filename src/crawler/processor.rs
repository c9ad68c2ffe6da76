//! One task in, one result out
//!
//! `PageProcessor` fetches a listing page, follows each of its detail links
//! and collects the extracted records into a `TaskResult`.

use crate::config::Config;
use crate::crawler::extractor::{ListingExtractor, PageExtractor};
use crate::crawler::fetcher::{
    FetchError, FetchedPage, HttpFetcher, PageInspector, PageKind, RetryPolicy, RetryingFetcher,
};
use crate::model::{Task, TaskResult};
use crate::HarvestError;
use std::sync::Arc;
use url::Url;

/// Turns tasks into results
#[derive(Clone)]
pub struct PageProcessor {
    fetcher: RetryingFetcher,
    extractor: Arc<dyn PageExtractor>,
    base_url: Url,
}

impl PageProcessor {
    pub fn new(fetcher: RetryingFetcher, extractor: Arc<dyn PageExtractor>, base_url: Url) -> Self {
        Self {
            fetcher,
            extractor,
            base_url,
        }
    }

    /// Builds the HTTP fetcher and bundled extractor from configuration
    pub fn from_config(config: &Config) -> Result<Self, HarvestError> {
        let base_url = Url::parse(&config.crawler.base_url)?;
        let extractor = Arc::new(ListingExtractor::new(&config.selectors)?);
        let http = Arc::new(HttpFetcher::new(&config.crawler, &config.fetch)?);
        let inspector: Arc<dyn PageInspector> = extractor.clone();
        let fetcher = RetryingFetcher::new(http, inspector, RetryPolicy::from(&config.fetch));

        Ok(Self::new(fetcher, extractor, base_url))
    }

    /// URL of a numbered listing page
    pub fn listing_url(&self, page_number: u32) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("page", &page_number.to_string());
        url
    }

    /// Processes one task
    ///
    /// Listings that fail soft extraction, or whose detail page the server
    /// refuses, are skipped. A listing page without listings, or one the server
    /// reports as gone (404/410), yields an exhausted result with no records.
    ///
    /// # Returns
    ///
    /// * `Ok(TaskResult)` - The task's outcome, possibly with zero records
    /// * `Err(FetchError)` - The listing page itself could not be loaded: the attempt
    ///   cap ran out or the server refused it with another client error
    pub async fn process(&self, task: &Task) -> Result<TaskResult, FetchError> {
        let page_url = self.listing_url(task.page_number);

        let body = match self.fetcher.fetch(page_url.as_str(), PageKind::Listing).await {
            Ok(FetchedPage::Ready(body)) => body,
            Ok(FetchedPage::Empty) => {
                tracing::info!("Page {} has no listings, range exhausted", task.page_number);
                return Ok(TaskResult::exhausted(task));
            }
            Err(e) if e.is_gone() => {
                tracing::info!("{}, treating page {} as past the end", e, task.page_number);
                return Ok(TaskResult::exhausted(task));
            }
            Err(e) => return Err(e),
        };

        let links = self.extractor.listing_links(&body, &page_url);
        if links.is_empty() {
            tracing::info!("Page {} has no listing links, range exhausted", task.page_number);
            return Ok(TaskResult::exhausted(task));
        }

        tracing::info!("Parsing page {} ({} listings)", task.page_number, links.len());

        let mut result = TaskResult::empty(task);
        for link in links {
            let detail = match self.fetcher.fetch(&link, PageKind::Detail).await {
                Ok(FetchedPage::Ready(detail)) => detail,
                Ok(FetchedPage::Empty) => {
                    tracing::debug!("Detail page {} is empty, skipping", link);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Skipping listing: {}", e);
                    continue;
                }
            };

            match self.extractor.extract(&detail, &link) {
                Ok(record) => result.records.push(record),
                Err(e) => tracing::warn!("Skipping {}: {}", link, e),
            }
        }

        tracing::info!(
            "Finished page {}: {} records",
            task.page_number,
            result.records.len()
        );
        Ok(result)
    }
}

use crate::config::types::{
    Config, CrawlerConfig, FetchConfig, QueueConfig, SelectorConfig, StorageBackend,
    StorageConfig,
};
use crate::ConfigError;
use scraper::Selector;
use url::Url;

const MAX_CONCURRENCY: usize = 256;
const MAX_WORKER_CONCURRENCY: usize = 64;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_fetch_config(&config.fetch)?;
    validate_storage_config(&config.storage)?;
    validate_queue_config(&config.queue)?;
    validate_selectors(&config.selectors)?;
    Ok(())
}

/// Validates crawl range and pool settings
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "base_url '{}' must use http or https",
            config.base_url
        )));
    }

    if config.first_page == 0 {
        return Err(ConfigError::Validation(
            "first_page must be >= 1".to_string(),
        ));
    }

    if config.last_page < config.first_page {
        return Err(ConfigError::Validation(format!(
            "page range is empty: first_page {} > last_page {}",
            config.first_page, config.last_page
        )));
    }

    if config.max_concurrency < 1 || config.max_concurrency > MAX_CONCURRENCY {
        return Err(ConfigError::Validation(format!(
            "max_concurrency must be between 1 and {}, got {}",
            MAX_CONCURRENCY, config.max_concurrency
        )));
    }

    if config.submit_poll_ms == 0 {
        return Err(ConfigError::Validation(
            "submit_poll_ms must be > 0".to_string(),
        ));
    }

    if config.drain_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "drain_interval_ms must be > 0".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates that the selected backend has its connection parameters
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    match config.backend {
        StorageBackend::Relational => {
            if config.database_path.is_empty() {
                return Err(ConfigError::Validation(
                    "database_path cannot be empty for the relational backend".to_string(),
                ));
            }
        }
        StorageBackend::Document => {
            if config.mongo_uri.is_empty() {
                return Err(ConfigError::Validation(
                    "mongo_uri cannot be empty for the document backend".to_string(),
                ));
            }
            if config.mongo_database.is_empty() {
                return Err(ConfigError::Validation(
                    "mongo_database cannot be empty for the document backend".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_queue_config(config: &QueueConfig) -> Result<(), ConfigError> {
    if config.task_channel.is_empty() || config.result_channel.is_empty() {
        return Err(ConfigError::Validation(
            "task_channel and result_channel cannot be empty".to_string(),
        ));
    }

    if config.task_channel == config.result_channel {
        return Err(ConfigError::Validation(format!(
            "task_channel and result_channel must differ, both are '{}'",
            config.task_channel
        )));
    }

    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "poll_interval_ms must be > 0".to_string(),
        ));
    }

    if config.dispatch_batch == 0 {
        return Err(ConfigError::Validation(
            "dispatch_batch must be >= 1".to_string(),
        ));
    }

    if config.dispatch_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "dispatch_interval_ms must be > 0".to_string(),
        ));
    }

    if config.worker_concurrency < 1 || config.worker_concurrency > MAX_WORKER_CONCURRENCY {
        return Err(ConfigError::Validation(format!(
            "worker_concurrency must be between 1 and {}, got {}",
            MAX_WORKER_CONCURRENCY, config.worker_concurrency
        )));
    }

    Ok(())
}

/// Validates that every configured CSS selector parses
fn validate_selectors(config: &SelectorConfig) -> Result<(), ConfigError> {
    let singles = [
        &config.page_header,
        &config.page_footer,
        &config.listing_item,
        &config.listing_link,
        &config.sold_marker,
        &config.title,
        &config.price,
        &config.odometer,
        &config.phone_number,
        &config.image,
        &config.images_count,
        &config.plate_number,
    ];

    for selector in singles
        .into_iter()
        .chain(config.seller_name.iter())
        .chain(config.identity.iter())
    {
        validate_selector(selector)?;
    }

    if config.identity.is_empty() {
        return Err(ConfigError::Validation(
            "at least one identity selector is required".to_string(),
        ));
    }

    Ok(())
}

fn validate_selector(selector: &str) -> Result<(), ConfigError> {
    Selector::parse(selector).map_err(|e| ConfigError::InvalidSelector {
        selector: selector.to_string(),
        message: format!("{:?}", e),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn base_toml() -> String {
        r#"
[crawler]
base-url = "https://listings.example.com/search"
last-page = 3

[storage]
backend = "relational"
database-path = "./harvest.db"
"#
        .to_string()
    }

    fn with_section(extra: &str) -> String {
        format!("{}\n{}", base_toml(), extra)
    }

    #[test]
    fn test_valid_config() {
        assert!(parse_config(&base_toml()).is_ok());
    }

    #[test]
    fn test_zero_first_page() {
        let toml = base_toml().replace("last-page = 3", "first-page = 0\nlast-page = 3");
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_range() {
        let toml = base_toml().replace("last-page = 3", "first-page = 4\nlast-page = 3");
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_single_page_range_is_valid() {
        let toml = base_toml().replace("last-page = 3", "first-page = 3\nlast-page = 3");
        assert!(parse_config(&toml).is_ok());
    }

    #[test]
    fn test_max_concurrency_bounds() {
        let too_high = base_toml().replace("last-page = 3", "last-page = 3\nmax-concurrency = 257");
        assert!(parse_config(&too_high).is_err());

        let at_limit = base_toml().replace("last-page = 3", "last-page = 3\nmax-concurrency = 256");
        assert!(parse_config(&at_limit).is_ok());
    }

    #[test]
    fn test_non_http_base_url() {
        let toml = base_toml().replace("https://listings.example.com/search", "ftp://example.com/");
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_relational_requires_path() {
        let toml = base_toml().replace("database-path = \"./harvest.db\"", "");
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_document_requires_uri_and_database() {
        let toml = base_toml().replace(
            "backend = \"relational\"\ndatabase-path = \"./harvest.db\"",
            "backend = \"document\"\nmongo-uri = \"mongodb://localhost\"",
        );
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_identical_channels_rejected() {
        let toml = with_section("[queue]\ntask-channel = \"jobs\"\nresult-channel = \"jobs\"");
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let toml = with_section("[queue]\npoll-interval-ms = 0");
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_worker_concurrency_bounds() {
        assert!(parse_config(&with_section("[queue]\nworker-concurrency = 0")).is_err());
        assert!(parse_config(&with_section("[queue]\nworker-concurrency = 4")).is_ok());
    }

    #[test]
    fn test_invalid_selector() {
        let toml = with_section("[selectors]\ntitle = \"h1[[\"");
        assert!(matches!(
            parse_config(&toml),
            Err(ConfigError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn test_empty_identity_selectors_rejected() {
        let toml = with_section("[selectors]\nidentity = []");
        assert!(parse_config(&toml).is_err());
    }
}

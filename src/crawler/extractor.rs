//! Listing page and detail page extraction
//!
//! `ListingExtractor` is the bundled, CSS-selector driven extractor. It knows
//! three things about the site:
//! - whether a loaded page is fully rendered (its landmarks are present)
//! - which detail links a listing page carries
//! - how to turn a detail page into a `Record`
//!
//! Field extraction raises `ExtractError` for listings that should be skipped;
//! these are soft signals, never a reason to abort a task.

use crate::config::SelectorConfig;
use crate::crawler::fetcher::{PageCondition, PageInspector, PageKind};
use crate::model::Record;
use crate::ConfigError;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

/// Soft per-listing extraction failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("listing already sold")]
    Sold,

    #[error("listing has no identity (VIN)")]
    NoIdentity,

    #[error("listing has no seller name")]
    NoOperatorName,

    #[error("detail page uses an unsupported layout")]
    UnsupportedLayout,
}

/// Turns page bodies into links and records
pub trait PageExtractor: Send + Sync {
    /// Detail page URLs on a listing page, absolute and without repeats
    fn listing_links(&self, body: &str, page_url: &Url) -> Vec<String>;

    /// Extracts one record from a detail page
    fn extract(&self, body: &str, url: &str) -> Result<Record, ExtractError>;
}

struct CompiledSelectors {
    page_header: Selector,
    page_footer: Selector,
    listing_item: Selector,
    listing_link: Selector,
    sold_marker: Selector,
    title: Selector,
    price: Selector,
    odometer: Selector,
    seller_name: Vec<Selector>,
    phone_number: Selector,
    image: Selector,
    images_count: Selector,
    plate_number: Selector,
    identity: Vec<Selector>,
}

fn compile(selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector).map_err(|e| ConfigError::InvalidSelector {
        selector: selector.to_string(),
        message: format!("{:?}", e),
    })
}

fn compile_all(selectors: &[String]) -> Result<Vec<Selector>, ConfigError> {
    selectors.iter().map(|s| compile(s)).collect()
}

/// CSS-selector based extractor for the listing site
pub struct ListingExtractor {
    selectors: CompiledSelectors,
}

impl ListingExtractor {
    /// Compiles the configured selectors
    ///
    /// # Returns
    ///
    /// * `Ok(ListingExtractor)` - All selectors compiled
    /// * `Err(ConfigError::InvalidSelector)` - A selector failed to parse
    pub fn new(config: &SelectorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            selectors: CompiledSelectors {
                page_header: compile(&config.page_header)?,
                page_footer: compile(&config.page_footer)?,
                listing_item: compile(&config.listing_item)?,
                listing_link: compile(&config.listing_link)?,
                sold_marker: compile(&config.sold_marker)?,
                title: compile(&config.title)?,
                price: compile(&config.price)?,
                odometer: compile(&config.odometer)?,
                seller_name: compile_all(&config.seller_name)?,
                phone_number: compile(&config.phone_number)?,
                image: compile(&config.image)?,
                images_count: compile(&config.images_count)?,
                plate_number: compile(&config.plate_number)?,
                identity: compile_all(&config.identity)?,
            },
        })
    }

    fn has(document: &Html, selector: &Selector) -> bool {
        document.select(selector).next().is_some()
    }

    fn text_of(element: ElementRef<'_>) -> Option<String> {
        let text = element.text().collect::<String>();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    }

    fn first_text(document: &Html, selector: &Selector) -> Option<String> {
        document.select(selector).find_map(Self::text_of)
    }

    /// Text directly inside the first match, ignoring nested elements
    fn own_text(document: &Html, selector: &Selector) -> Option<String> {
        document.select(selector).find_map(|element| {
            let text: String = element
                .children()
                .filter_map(|child| child.value().as_text().map(|t| t.to_string()))
                .collect();
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            (!text.is_empty()).then_some(text)
        })
    }

    fn first_text_of_any(document: &Html, selectors: &[Selector]) -> Option<String> {
        selectors
            .iter()
            .find_map(|selector| Self::first_text(document, selector))
    }

    fn first_attr(document: &Html, selector: &Selector, attr: &str) -> Option<String> {
        document
            .select(selector)
            .filter_map(|element| element.value().attr(attr))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn title(&self, document: &Html) -> Option<String> {
        Self::first_attr(document, &self.selectors.title, "title")
            .or_else(|| Self::first_text(document, &self.selectors.title))
    }

    fn image_url(&self, document: &Html) -> Option<String> {
        // srcset may list several candidates; the first URL is enough
        Self::first_attr(document, &self.selectors.image, "srcset")
            .or_else(|| Self::first_attr(document, &self.selectors.image, "src"))
            .and_then(|srcset| srcset.split_whitespace().next().map(str::to_string))
    }

    fn images_count(&self, document: &Html) -> u32 {
        // rendered as e.g. "of 14"
        Self::first_text(document, &self.selectors.images_count)
            .and_then(|text| {
                text.split_whitespace()
                    .filter_map(|token| token.parse::<u32>().ok())
                    .last()
            })
            .unwrap_or(0)
    }

    fn phone_number(&self, document: &Html) -> Option<String> {
        Self::first_attr(document, &self.selectors.phone_number, "data-phone")
            .or_else(|| Self::first_text(document, &self.selectors.phone_number))
            .map(|raw| normalize_phone(&raw))
            .filter(|phone| phone.len() > 1)
    }
}

/// Parses a price such as "12 500 $" or "€ 9 000" into a number
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .replace('$', "")
        .replace("грн", "")
        .replace('€', "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    cleaned.replace(',', ".").parse().ok()
}

/// Parses an odometer reading such as "95 тыс. км" into its leading number
pub fn parse_odometer(text: &str) -> Option<f64> {
    let number: String = text
        .chars()
        .take_while(|c| c.is_ascii_digit() || c.is_whitespace() || *c == '.' || *c == ',')
        .filter(|c| !c.is_whitespace())
        .collect();
    number.replace(',', ".").parse().ok()
}

fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    format!("+{}", digits)
}

impl PageInspector for ListingExtractor {
    fn inspect(&self, kind: PageKind, body: &str) -> PageCondition {
        let document = Html::parse_document(body);
        let rendered = Self::has(&document, &self.selectors.page_header)
            && Self::has(&document, &self.selectors.page_footer);

        match kind {
            PageKind::Listing => {
                let has_items = Self::has(&document, &self.selectors.listing_item);
                match (rendered, has_items) {
                    (true, true) => PageCondition::Ready,
                    (_, false) => PageCondition::Empty,
                    (false, true) => PageCondition::Incomplete,
                }
            }
            PageKind::Detail if rendered => PageCondition::Ready,
            PageKind::Detail => PageCondition::Incomplete,
        }
    }
}

impl PageExtractor for ListingExtractor {
    fn listing_links(&self, body: &str, page_url: &Url) -> Vec<String> {
        let document = Html::parse_document(body);
        let mut links: Vec<String> = Vec::new();

        for href in document
            .select(&self.selectors.listing_link)
            .filter_map(|a| a.value().attr("href"))
        {
            match page_url.join(href.trim()) {
                Ok(url) => {
                    let url = url.to_string();
                    if !links.contains(&url) {
                        links.push(url);
                    }
                }
                Err(e) => tracing::debug!("Skipping unparseable listing link {}: {}", href, e),
            }
        }

        links
    }

    fn extract(&self, body: &str, url: &str) -> Result<Record, ExtractError> {
        let document = Html::parse_document(body);
        let s = &self.selectors;

        if Self::has(&document, &s.sold_marker) {
            return Err(ExtractError::Sold);
        }

        let title = self.title(&document);
        if title.is_none() && Self::first_text_of_any(&document, &s.identity).is_none() {
            return Err(ExtractError::UnsupportedLayout);
        }

        let seller_name =
            Self::first_text_of_any(&document, &s.seller_name).ok_or(ExtractError::NoOperatorName)?;
        let identity =
            Self::first_text_of_any(&document, &s.identity).ok_or(ExtractError::NoIdentity)?;

        let mut record = Record::new(url).with_identity(identity);
        record.title = title;
        record.price_usd = Self::first_text(&document, &s.price).and_then(|t| parse_price(&t));
        record.odometer = Self::first_text(&document, &s.odometer).and_then(|t| parse_odometer(&t));
        record.seller_name = Some(seller_name);
        record.phone_number = self.phone_number(&document);
        record.image_url = self.image_url(&document);
        record.images_count = self.images_count(&document);
        record.plate_number = Self::own_text(&document, &s.plate_number);

        Ok(record)
    }
}

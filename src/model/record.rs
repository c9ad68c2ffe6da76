use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One extracted listing
///
/// `identity` is the natural key (a vehicle identification number on the
/// bundled site). A record without a non-blank identity can never be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Record {
    pub identity: Option<String>,
    pub url: String,
    pub title: Option<String>,
    pub price_usd: Option<f64>,
    pub odometer: Option<f64>,
    pub seller_name: Option<String>,
    pub phone_number: Option<String>,
    pub image_url: Option<String>,
    pub images_count: u32,
    pub plate_number: Option<String>,
    pub found_at: DateTime<Utc>,
}

impl Record {
    /// Creates a record with only its source URL and discovery time filled in
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            identity: None,
            url: url.into(),
            title: None,
            price_usd: None,
            odometer: None,
            seller_name: None,
            phone_number: None,
            image_url: None,
            images_count: 0,
            plate_number: None,
            found_at: Utc::now(),
        }
    }

    /// Sets the identity, builder style
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Returns the dedup key, or `None` when the identity is absent or blank
    pub fn identity_key(&self) -> Option<&str> {
        self.identity
            .as_deref()
            .map(str::trim)
            .filter(|identity| !identity.is_empty())
    }
}

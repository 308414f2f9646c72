use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::defaults;
use crate::models::{generate_id, Marketplace, ProductStatus, ScrapedRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: String,
    pub url: String,
    pub marketplace: Marketplace,
    pub listing_id: Option<String>,

    // Listing details, refreshed on every successful scrape
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub currency: String,
    pub in_stock: bool,

    // Alert rules
    pub target_price: Option<Decimal>,

    // Schedule
    pub check_interval_secs: i64,
    pub last_checked: Option<DateTime<Utc>>,

    // Tracking state
    pub status: ProductStatus,
    pub current_price: Option<Decimal>,
    pub consecutive_failure_count: u32,
    pub last_error: Option<String>,

    // Price statistics
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub price_checks_count: i64,

    // Metadata
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// "Track product" command as issued by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewProduct {
    #[validate(url)]
    pub url: String,
    /// Inferred from the URL when omitted.
    pub marketplace: Option<Marketplace>,
    pub target_price: Option<Decimal>,
    #[validate(range(min = 1, max = 168))]
    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: u32,
}

fn default_check_interval_hours() -> u32 {
    defaults::CHECK_INTERVAL_HOURS
}

impl Product {
    pub fn new(new_product: NewProduct, marketplace: Marketplace) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            listing_id: marketplace.listing_id(&new_product.url),
            url: new_product.url,
            marketplace,
            title: None,
            image_url: None,
            currency: defaults::CURRENCY.to_string(),
            in_stock: true,
            target_price: new_product.target_price,
            check_interval_secs: i64::from(new_product.check_interval_hours) * 3600,
            last_checked: None,
            status: ProductStatus::Active,
            current_price: None,
            consecutive_failure_count: 0,
            last_error: None,
            min_price: None,
            max_price: None,
            avg_price: None,
            price_checks_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::seconds(self.check_interval_secs)
    }

    /// Active and its check interval has elapsed since the last check. Paused and errored
    /// products are never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != ProductStatus::Active {
            return false;
        }

        match self.last_checked {
            Some(last_checked) => now - last_checked >= self.check_interval(),
            None => true, // Never checked before
        }
    }

    /// Fold a successful scrape into the tracking state.
    pub fn apply_success(&mut self, record: &ScrapedRecord, now: DateTime<Utc>) {
        let price = record.price;

        self.current_price = Some(price);
        self.currency = record.currency.clone();
        self.in_stock = record.in_stock;
        if let Some(title) = &record.title {
            self.title = Some(title.clone());
        }
        if let Some(image_url) = &record.image_url {
            self.image_url = Some(image_url.clone());
        }

        self.price_checks_count += 1;
        self.min_price = Some(self.min_price.map_or(price, |min| min.min(price)));
        self.max_price = Some(self.max_price.map_or(price, |max| max.max(price)));
        self.avg_price = Some(match self.avg_price {
            Some(avg) => {
                let n = Decimal::from(self.price_checks_count);
                ((avg * (n - Decimal::ONE) + price) / n).round_dp(2)
            }
            None => price,
        });

        self.last_checked = Some(now);
        self.consecutive_failure_count = 0;
        self.last_error = None;
        if self.status == ProductStatus::Error {
            self.status = ProductStatus::Active;
        }
        self.updated_at = now;
    }

    /// Record a job that ran out of attempts. Returns `true` when this failure moved the
    /// product into `error`.
    pub fn apply_exhausted(&mut self, error: &str, failure_threshold: u32, now: DateTime<Utc>) -> bool {
        self.consecutive_failure_count += 1;
        self.last_error = Some(error.to_string());
        self.last_checked = Some(now);
        self.updated_at = now;

        if self.status == ProductStatus::Active && self.consecutive_failure_count >= failure_threshold {
            self.status = ProductStatus::Error;
            return true;
        }
        false
    }

    pub fn pause(&mut self) {
        self.status = ProductStatus::Paused;
        self.updated_at = Utc::now();
    }

    /// Back to `active`. Also the manual re-trigger for products in `error`: the failure
    /// streak is cleared and the product becomes due immediately.
    pub fn resume(&mut self) {
        if self.status == ProductStatus::Error {
            self.consecutive_failure_count = 0;
            self.last_checked = None;
        }
        self.status = ProductStatus::Active;
        self.updated_at = Utc::now();
    }
}

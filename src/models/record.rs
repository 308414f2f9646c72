use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalized output of a marketplace parser. Lives only as long as one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedRecord {
    /// Positive, rounded to two decimal places.
    pub price: Decimal,
    pub currency: String,
    pub in_stock: bool,
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod alert;
pub mod attempt;
pub mod price_history;
pub mod product;
pub mod proxy;
pub mod record;

// Re-exports for convenience
pub use alert::*;
pub use attempt::*;
pub use price_history::*;
pub use product::*;
pub use proxy::*;
pub use record::*;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT")]
pub enum Marketplace {
    #[sqlx(rename = "amazon")]
    Amazon,
    #[sqlx(rename = "ebay")]
    Ebay,
    #[sqlx(rename = "aliexpress")]
    AliExpress,
}

impl Marketplace {
    pub const ALL: [Marketplace; 3] = [Marketplace::Amazon, Marketplace::Ebay, Marketplace::AliExpress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Amazon => "amazon",
            Marketplace::Ebay => "ebay",
            Marketplace::AliExpress => "aliexpress",
        }
    }

    /// Detect the marketplace from a product URL's host (`www.amazon.co.uk`, `m.ebay.com`, ...).
    pub fn from_url(raw: &str) -> Option<Self> {
        let parsed = url::Url::parse(raw).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        let labels: Vec<&str> = host.split('.').collect();

        if labels.contains(&"amazon") {
            Some(Marketplace::Amazon)
        } else if labels.contains(&"ebay") {
            Some(Marketplace::Ebay)
        } else if labels.contains(&"aliexpress") {
            Some(Marketplace::AliExpress)
        } else {
            None
        }
    }

    /// Marketplace-side listing identifier (ASIN, eBay item number, AliExpress item id).
    pub fn listing_id(&self, raw: &str) -> Option<String> {
        let parsed = url::Url::parse(raw).ok()?;
        let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();

        match self {
            Marketplace::Amazon => segments
                .windows(2)
                .find(|w| w[0] == "dp" || w[0] == "product")
                .map(|w| w[1].to_string())
                .filter(|asin| asin.len() == 10 && asin.chars().all(|c| c.is_ascii_alphanumeric())),
            Marketplace::Ebay => segments
                .windows(2)
                .find(|w| w[0] == "itm")
                .map(|w| w[1].to_string())
                .filter(|id| id.chars().all(|c| c.is_ascii_digit())),
            Marketplace::AliExpress => segments
                .windows(2)
                .find(|w| w[0] == "item")
                .and_then(|w| w[1].strip_suffix(".html"))
                .map(|id| id.to_string()),
        }
    }

    /// AliExpress renders prices client-side and needs a driven browser.
    pub fn requires_browser(&self) -> bool {
        matches!(self, Marketplace::AliExpress)
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amazon" => Ok(Marketplace::Amazon),
            "ebay" => Ok(Marketplace::Ebay),
            "aliexpress" => Ok(Marketplace::AliExpress),
            other => Err(format!("unknown marketplace: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT")]
pub enum ProductStatus {
    #[sqlx(rename = "active")]
    Active,
    #[sqlx(rename = "paused")]
    Paused,
    #[sqlx(rename = "error")]
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Residential,
    Datacenter,
}

impl ProxyKind {
    /// Lower ranks are preferred when everything else is equal.
    pub fn preference_rank(&self) -> u8 {
        match self {
            ProxyKind::Residential => 0,
            ProxyKind::Datacenter => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    TargetReached,
    NewLow,
    PercentDrop,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::TargetReached => "target_reached",
            TriggerReason::NewLow => "new_low",
            TriggerReason::PercentDrop => "percent_drop",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Helper function to generate UUIDs in the format expected by the database
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

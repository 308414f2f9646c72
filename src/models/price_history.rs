use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{generate_id, ScrapedRecord};

/// Immutable point in a product's price time series. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSnapshot {
    pub id: String,
    pub product_id: String,
    pub price: Decimal,
    pub currency: String,
    pub in_stock: bool,
    pub response_time_ms: Option<i64>,
    pub scraped_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn from_record(product_id: &str, record: &ScrapedRecord, response_time_ms: Option<i64>) -> Self {
        Self {
            id: generate_id(),
            product_id: product_id.to_string(),
            price: record.price,
            currency: record.currency.clone(),
            in_stock: record.in_stock,
            response_time_ms,
            scraped_at: record.scraped_at,
        }
    }
}

/// Lowest price among `history`, if any.
pub fn historical_low(history: &[PriceSnapshot]) -> Option<Decimal> {
    history.iter().map(|s| s.price).min()
}

/// Price of the most recent snapshot by `scraped_at`.
pub fn latest_price(history: &[PriceSnapshot]) -> Option<Decimal> {
    history.iter().max_by_key(|s| s.scraped_at).map(|s| s.price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(price: i64, minutes_ago: i64) -> PriceSnapshot {
        PriceSnapshot {
            id: generate_id(),
            product_id: "p1".to_string(),
            price: Decimal::from(price),
            currency: "USD".to_string(),
            in_stock: true,
            response_time_ms: None,
            scraped_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn test_snapshot_from_record() {
        let record = ScrapedRecord {
            price: Decimal::new(1999, 2),
            currency: "USD".to_string(),
            in_stock: false,
            title: None,
            image_url: None,
            scraped_at: Utc::now(),
        };
        let snapshot = PriceSnapshot::from_record("p1", &record, Some(420));

        assert_eq!(snapshot.product_id, "p1");
        assert_eq!(snapshot.price, Decimal::new(1999, 2));
        assert!(!snapshot.in_stock);
        assert_eq!(snapshot.response_time_ms, Some(420));
        assert_eq!(snapshot.scraped_at, record.scraped_at);
    }

    #[test]
    fn test_history_helpers() {
        let history = vec![snapshot(60, 30), snapshot(40, 20), snapshot(55, 10)];

        assert_eq!(historical_low(&history), Some(Decimal::from(40)));
        assert_eq!(latest_price(&history), Some(Decimal::from(55)));
        assert_eq!(historical_low(&[]), None);
        assert_eq!(latest_price(&[]), None);
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::models::{Marketplace, NewProduct, PriceSnapshot, Product, ProductStatus};
use crate::storage::Storage;
use crate::utils::error::{AppError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ProductUpdate {
    pub target_price: Option<Decimal>,
    #[validate(range(min = 1, max = 168))]
    pub check_interval_hours: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductStats {
    pub status: ProductStatus,
    pub total_checks: i64,
    pub snapshots: usize,
    pub current_price: Option<Decimal>,
    pub lowest_price: Option<Decimal>,
    pub highest_price: Option<Decimal>,
    pub average_price: Option<Decimal>,
    pub average_response_time_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Command surface used by the API layer: track, pause, resume and read products.
/// Scheduling and price state are owned by the scheduler and alert engine.
pub struct ProductManager {
    storage: Arc<dyn Storage>,
}

impl ProductManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn track_product(&self, new_product: NewProduct) -> Result<Product> {
        new_product.validate()?;
        validate_target_price(new_product.target_price)?;

        let detected = Marketplace::from_url(&new_product.url);
        let marketplace = match (new_product.marketplace, detected) {
            (Some(given), Some(detected)) if given != detected => {
                return Err(AppError::Validation(format!(
                    "URL belongs to {} but marketplace {} was requested",
                    detected, given
                )));
            }
            (Some(given), _) => given,
            (None, Some(detected)) => detected,
            (None, None) => return Err(AppError::UnsupportedMarketplace(new_product.url)),
        };

        let existing = self.storage.list_products().await?;
        if existing.iter().any(|p| p.url == new_product.url) {
            return Err(AppError::Validation(format!("{} is already tracked", new_product.url)));
        }

        let product = Product::new(new_product, marketplace);
        self.storage.insert_product(&product).await?;

        info!(
            product_id = %product.id,
            marketplace = %product.marketplace,
            target_price = ?product.target_price,
            "Tracking new product"
        );
        Ok(product)
    }

    /// One result per input, in order. A rejected item does not stop the rest.
    pub async fn track_products(&self, new_products: Vec<NewProduct>) -> Vec<Result<Product>> {
        let mut results = Vec::with_capacity(new_products.len());
        for new_product in new_products {
            results.push(self.track_product(new_product).await);
        }
        results
    }

    pub async fn get_product(&self, product_id: &str) -> Result<Product> {
        self.storage
            .load_product(product_id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("product {}", product_id),
            })
    }

    pub async fn list_products(&self) -> Result<Vec<Product>> {
        self.storage.list_products().await
    }

    pub async fn update_product(&self, product_id: &str, update: ProductUpdate) -> Result<Product> {
        update.validate()?;
        validate_target_price(update.target_price)?;

        let mut product = self.get_product(product_id).await?;
        if let Some(target_price) = update.target_price {
            product.target_price = Some(target_price);
        }
        if let Some(hours) = update.check_interval_hours {
            product.check_interval_secs = i64::from(hours) * 3600;
        }
        product.updated_at = Utc::now();

        self.storage.save_product_state(&product).await?;
        Ok(product)
    }

    pub async fn pause_product(&self, product_id: &str) -> Result<Product> {
        let mut product = self.get_product(product_id).await?;
        if product.status != ProductStatus::Paused {
            product.pause();
            self.storage.save_product_state(&product).await?;
            info!(product_id, "Product paused");
        }
        Ok(product)
    }

    /// Also the manual re-trigger for products in `error`.
    pub async fn resume_product(&self, product_id: &str) -> Result<Product> {
        let mut product = self.get_product(product_id).await?;
        if product.status != ProductStatus::Active {
            let previous = product.status;
            product.resume();
            self.storage.save_product_state(&product).await?;
            info!(product_id, from = ?previous, "Product resumed");
        }
        Ok(product)
    }

    pub async fn price_history(&self, product_id: &str) -> Result<Vec<PriceSnapshot>> {
        // Distinguish "unknown product" from "no snapshots yet"
        self.get_product(product_id).await?;
        self.storage.load_price_history(product_id).await
    }

    pub async fn get_product_stats(&self, product_id: &str) -> Result<ProductStats> {
        let product = self.get_product(product_id).await?;
        let history = self.storage.load_price_history(product_id).await?;

        let timings: Vec<i64> = history.iter().filter_map(|s| s.response_time_ms).collect();
        let average_response_time_ms = if timings.is_empty() {
            None
        } else {
            Some(timings.iter().sum::<i64>() as f64 / timings.len() as f64)
        };

        Ok(ProductStats {
            status: product.status,
            total_checks: product.price_checks_count,
            snapshots: history.len(),
            current_price: product.current_price,
            lowest_price: product.min_price,
            highest_price: product.max_price,
            average_price: product.avg_price,
            average_response_time_ms,
            consecutive_failures: product.consecutive_failure_count,
            last_check: product.last_checked,
            last_error: product.last_error,
        })
    }
}

fn validate_target_price(target_price: Option<Decimal>) -> Result<()> {
    match target_price {
        Some(price) if price <= Decimal::ZERO => Err(AppError::Validation(format!(
            "target price must be positive, got {}",
            price
        ))),
        _ => Ok(()),
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{sort_by_staleness, Storage};
use crate::models::{PriceSnapshot, Product};
use crate::utils::error::{AppError, Result};

/// Process-local storage for tests and `--once` dry runs.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    products: Arc<RwLock<HashMap<String, Product>>>,
    history: Arc<RwLock<HashMap<String, Vec<PriceSnapshot>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self, product_id: &str) -> usize {
        let history = self.history.read().await;
        history.get(product_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_product(&self, product: &Product) -> Result<()> {
        let mut products = self.products.write().await;
        if products.contains_key(&product.id) {
            return Err(AppError::Validation(format!("product {} already exists", product.id)));
        }
        products.insert(product.id.clone(), product.clone());
        Ok(())
    }

    async fn load_product(&self, id: &str) -> Result<Option<Product>> {
        let products = self.products.read().await;
        Ok(products.get(id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        let products = self.products.read().await;
        let mut all: Vec<Product> = products.values().cloned().collect();
        all.sort_by_key(|p| p.created_at);
        Ok(all)
    }

    async fn load_due_products(&self, now: DateTime<Utc>) -> Result<Vec<Product>> {
        let products = self.products.read().await;
        let mut due: Vec<Product> = products.values().filter(|p| p.is_due(now)).cloned().collect();
        sort_by_staleness(&mut due);
        Ok(due)
    }

    async fn save_product_state(&self, product: &Product) -> Result<()> {
        let mut products = self.products.write().await;
        match products.get_mut(&product.id) {
            Some(existing) => {
                *existing = product.clone();
                Ok(())
            }
            None => Err(AppError::NotFound {
                resource: format!("product {}", product.id),
            }),
        }
    }

    async fn append_snapshot(&self, snapshot: &PriceSnapshot) -> Result<()> {
        let mut history = self.history.write().await;
        history
            .entry(snapshot.product_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn load_price_history(&self, product_id: &str) -> Result<Vec<PriceSnapshot>> {
        let history = self.history.read().await;
        let mut snapshots = history.get(product_id).cloned().unwrap_or_default();
        snapshots.sort_by_key(|s| s.scraped_at);
        Ok(snapshots)
    }
}

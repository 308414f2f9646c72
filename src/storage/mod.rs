use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{PriceSnapshot, Product};
use crate::utils::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Persistence contract the pipeline runs against. Snapshots are append-only; products
/// are never deleted from here.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_product(&self, product: &Product) -> Result<()>;

    async fn load_product(&self, id: &str) -> Result<Option<Product>>;

    async fn list_products(&self) -> Result<Vec<Product>>;

    /// Active products whose check interval has elapsed, stalest first.
    async fn load_due_products(&self, now: DateTime<Utc>) -> Result<Vec<Product>>;

    async fn save_product_state(&self, product: &Product) -> Result<()>;

    async fn append_snapshot(&self, snapshot: &PriceSnapshot) -> Result<()>;

    /// Oldest first.
    async fn load_price_history(&self, product_id: &str) -> Result<Vec<PriceSnapshot>>;
}

/// Never-checked products first, then by oldest `last_checked`.
pub fn sort_by_staleness(products: &mut [Product]) {
    products.sort_by_key(|p| (p.last_checked.is_some(), p.last_checked));
}

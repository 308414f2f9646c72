use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

use super::{sort_by_staleness, Storage};
use crate::config::DatabaseConfig;
use crate::models::{PriceSnapshot, Product};
use crate::utils::error::{AppError, Result};

const PRODUCT_COLUMNS: &str = "id, url, marketplace, listing_id, title, image_url, currency, in_stock, \
     target_price, check_interval_secs, last_checked, status, current_price, consecutive_failure_count, \
     last_error, min_price, max_price, avg_price, price_checks_count, created_at, updated_at";

/// `sqlx` SQLite implementation. Decimals are stored as TEXT to keep exact cents.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        let in_memory = config.url.contains(":memory:");
        if !in_memory {
            if let Some(parent) = options.clone().get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        // Every in-memory connection is its own database, so keep exactly one alive
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        let storage = Self { pool };
        storage.migrate().await?;

        info!("Connected to database: {}", config.url);
        Ok(storage)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decimal_to_text(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

fn decode_decimal(row: &SqliteRow, column: &str) -> Result<Option<Decimal>> {
    let text: Option<String> = row.try_get(column)?;
    text.map(|t| {
        Decimal::from_str(&t).map_err(|e| AppError::Internal(format!("corrupt decimal in {}: {:?} ({})", column, t, e)))
    })
    .transpose()
}

fn product_from_row(row: &SqliteRow) -> Result<Product> {
    Ok(Product {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        marketplace: row.try_get("marketplace")?,
        listing_id: row.try_get("listing_id")?,
        title: row.try_get("title")?,
        image_url: row.try_get("image_url")?,
        currency: row.try_get("currency")?,
        in_stock: row.try_get("in_stock")?,
        target_price: decode_decimal(row, "target_price")?,
        check_interval_secs: row.try_get("check_interval_secs")?,
        last_checked: row.try_get("last_checked")?,
        status: row.try_get("status")?,
        current_price: decode_decimal(row, "current_price")?,
        consecutive_failure_count: row.try_get("consecutive_failure_count")?,
        last_error: row.try_get("last_error")?,
        min_price: decode_decimal(row, "min_price")?,
        max_price: decode_decimal(row, "max_price")?,
        avg_price: decode_decimal(row, "avg_price")?,
        price_checks_count: row.try_get("price_checks_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<PriceSnapshot> {
    Ok(PriceSnapshot {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        price: decode_decimal(row, "price")?.ok_or_else(|| AppError::Internal("snapshot without price".to_string()))?,
        currency: row.try_get("currency")?,
        in_stock: row.try_get("in_stock")?,
        response_time_ms: row.try_get("response_time_ms")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_product(&self, product: &Product) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO products ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            PRODUCT_COLUMNS
        ))
        .bind(&product.id)
        .bind(&product.url)
        .bind(product.marketplace)
        .bind(&product.listing_id)
        .bind(&product.title)
        .bind(&product.image_url)
        .bind(&product.currency)
        .bind(product.in_stock)
        .bind(decimal_to_text(product.target_price))
        .bind(product.check_interval_secs)
        .bind(product.last_checked)
        .bind(product.status)
        .bind(decimal_to_text(product.current_price))
        .bind(product.consecutive_failure_count)
        .bind(&product.last_error)
        .bind(decimal_to_text(product.min_price))
        .bind(decimal_to_text(product.max_price))
        .bind(decimal_to_text(product.avg_price))
        .bind(product.price_checks_count)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_product(&self, id: &str) -> Result<Option<Product>> {
        let row = sqlx::query(&format!("SELECT {} FROM products WHERE id = ?", PRODUCT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(&self) -> Result<Vec<Product>> {
        let rows = sqlx::query(&format!("SELECT {} FROM products ORDER BY created_at", PRODUCT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(product_from_row).collect()
    }

    async fn load_due_products(&self, now: DateTime<Utc>) -> Result<Vec<Product>> {
        let rows = sqlx::query(&format!("SELECT {} FROM products WHERE status = 'active'", PRODUCT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        let mut due = Vec::new();
        for row in &rows {
            let product = product_from_row(row)?;
            if product.is_due(now) {
                due.push(product);
            }
        }
        sort_by_staleness(&mut due);
        Ok(due)
    }

    async fn save_product_state(&self, product: &Product) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE products SET
                title = ?, image_url = ?, currency = ?, in_stock = ?, target_price = ?,
                check_interval_secs = ?, last_checked = ?, status = ?, current_price = ?,
                consecutive_failure_count = ?, last_error = ?, min_price = ?, max_price = ?,
                avg_price = ?, price_checks_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&product.title)
        .bind(&product.image_url)
        .bind(&product.currency)
        .bind(product.in_stock)
        .bind(decimal_to_text(product.target_price))
        .bind(product.check_interval_secs)
        .bind(product.last_checked)
        .bind(product.status)
        .bind(decimal_to_text(product.current_price))
        .bind(product.consecutive_failure_count)
        .bind(&product.last_error)
        .bind(decimal_to_text(product.min_price))
        .bind(decimal_to_text(product.max_price))
        .bind(decimal_to_text(product.avg_price))
        .bind(product.price_checks_count)
        .bind(product.updated_at)
        .bind(&product.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource: format!("product {}", product.id),
            });
        }
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: &PriceSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO price_history (id, product_id, price, currency, in_stock, response_time_ms, scraped_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.product_id)
        .bind(snapshot.price.to_string())
        .bind(&snapshot.currency)
        .bind(snapshot.in_stock)
        .bind(snapshot.response_time_ms)
        .bind(snapshot.scraped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_price_history(&self, product_id: &str) -> Result<Vec<PriceSnapshot>> {
        let rows = sqlx::query(
            "SELECT id, product_id, price, currency, in_stock, response_time_ms, scraped_at \
             FROM price_history WHERE product_id = ? ORDER BY scraped_at",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        // TEXT timestamps only sort lexically; re-sort on the parsed values
        let mut history = rows.iter().map(snapshot_from_row).collect::<Result<Vec<_>>>()?;
        history.sort_by_key(|s| s.scraped_at);
        Ok(history)
    }
}

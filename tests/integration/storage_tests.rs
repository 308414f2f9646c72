use super::*;
use price_sentinel::models::{PriceSnapshot, ProductStatus, ScrapedRecord};
use rust_decimal::Decimal;
use std::str::FromStr;

fn file_database(dir: &tempfile::TempDir) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("sqlite://{}/nested/sentinel.db", dir.path().display()),
        max_connections: 2,
    }
}

#[tokio::test]
async fn test_file_database_survives_reconnect() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = file_database(&dir);

    let product_id = {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect(&config).await?);
        let products = ProductManager::new(Arc::clone(&storage));
        let product = products
            .track_product(NewProduct {
                url: "https://www.aliexpress.com/item/1005004567890.html".to_string(),
                marketplace: None,
                target_price: Some(Decimal::from_str("12.50")?),
                check_interval_hours: 12,
            })
            .await?;

        let record = ScrapedRecord {
            price: Decimal::from_str("13.99")?,
            currency: "USD".to_string(),
            in_stock: true,
            title: Some("USB-C Hub".to_string()),
            image_url: Some("https://ae01.alicdn.com/kf/hub.jpg".to_string()),
            scraped_at: chrono::Utc::now(),
        };
        storage
            .append_snapshot(&PriceSnapshot::from_record(&product.id, &record, Some(840)))
            .await?;
        products.pause_product(&product.id).await?;
        product.id
    };

    // Reconnecting re-runs migrations against the existing file
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect(&config).await?);
    let products = ProductManager::new(Arc::clone(&storage));

    let product = products.get_product(&product_id).await?;
    assert_eq!(product.status, ProductStatus::Paused);
    assert_eq!(product.target_price, Some(Decimal::from_str("12.50")?));
    assert_eq!(product.listing_id.as_deref(), Some("1005004567890"));

    let history = products.price_history(&product_id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, Decimal::from_str("13.99")?);
    assert_eq!(history[0].response_time_ms, Some(840));
    assert!(storage.load_due_products(chrono::Utc::now()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_due_products_are_ordered_by_staleness() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let now = chrono::Utc::now();

    let mut ids = Vec::new();
    for (i, hours_ago) in [Some(8), None, Some(30), Some(2)].into_iter().enumerate() {
        let mut product = app.track(&format!("https://www.ebay.com/itm/10000{}", i), None).await?;
        product.last_checked = hours_ago.map(|h| now - chrono::Duration::hours(h));
        app.storage.save_product_state(&product).await?;
        ids.push(product.id);
    }

    let due: Vec<String> = app
        .storage
        .load_due_products(now)
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect();

    // Never checked, then 30h, then 8h; the 2h-old product is not due yet
    assert_eq!(due, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
    Ok(())
}

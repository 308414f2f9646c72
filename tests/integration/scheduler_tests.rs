use super::*;

const ECHO_URL: &str = "https://www.amazon.com/dp/B08N5WRWNW";
const LENS_URL: &str = "https://www.ebay.com/itm/125961524871";

fn ebay_page(title: &str, price: &str) -> String {
    format!(
        r#"<h1 class="x-item-title__mainTitle"><span class="ux-textspans">{}</span></h1>
           <div class="x-price-primary"><span class="ux-textspans">{}</span></div>"#,
        title, price
    )
}

#[tokio::test]
async fn test_scheduler_loop_processes_due_products() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let echo = app.track(ECHO_URL, None).await?;
    let lens = app.track(LENS_URL, None).await?;
    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$45.00"));
    app.fetcher.serve(LENS_URL, ebay_page("Camera Lens", "US $120.00"));

    app.scheduler.start()?;
    assert!(app.scheduler.is_running());

    let storage = Arc::clone(&app.storage);
    let (echo_id, lens_id) = (echo.id.clone(), lens.id.clone());
    let scraped = wait_for_condition(
        || {
            let storage = Arc::clone(&storage);
            let (echo_id, lens_id) = (echo_id.clone(), lens_id.clone());
            async move {
                let echo = storage.load_price_history(&echo_id).await.unwrap_or_default();
                let lens = storage.load_price_history(&lens_id).await.unwrap_or_default();
                !echo.is_empty() && !lens.is_empty()
            }
        },
        5,
    )
    .await;
    assert!(scraped, "both products should be scraped by the running loop");

    app.scheduler.stop().await;
    assert!(!app.scheduler.is_running());
    assert!(app.scheduler.drain(Duration::from_secs(5)).await);

    // Checked once; not due again for another interval
    assert_eq!(app.fetcher.calls(ECHO_URL), 1);
    assert_eq!(app.fetcher.calls(LENS_URL), 1);

    let stats = app.scheduler.stats();
    assert!(stats.ticks >= 1);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn test_repeated_ticks_never_duplicate_a_job() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let product = app.track(ECHO_URL, None).await?;
    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$45.00"));
    app.fetcher.set_delay(Duration::from_millis(300));

    let mut dispatched = 0;
    for _ in 0..5 {
        dispatched += app.scheduler.tick().await?.dispatched;
        assert!(app.scheduler.is_in_flight(&product.id));
    }
    assert_eq!(dispatched, 1);

    assert!(app.scheduler.drain(Duration::from_secs(5)).await);
    assert!(!app.scheduler.is_in_flight(&product.id));
    assert_eq!(app.fetcher.calls(ECHO_URL), 1);
    assert_eq!(app.products.price_history(&product.id).await?.len(), 1);
    assert_eq!(app.scheduler.stats().skipped_in_flight, 4);
    Ok(())
}

#[tokio::test]
async fn test_drain_aborts_jobs_past_the_grace_period() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let product = app.track(ECHO_URL, Some(50)).await?;
    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$45.00"));
    app.fetcher.set_delay(Duration::from_secs(5));

    app.scheduler.tick().await?;
    assert!(!app.scheduler.drain(Duration::from_millis(100)).await);
    assert!(!app.scheduler.is_in_flight(&product.id));

    // Nothing from the aborted job was committed
    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.last_checked, None);
    assert_eq!(stored.current_price, None);
    assert!(app.products.price_history(&product.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_without_start_is_a_no_op() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    app.scheduler.stop().await;
    assert!(!app.scheduler.is_running());
    assert!(app.scheduler.drain(Duration::from_millis(10)).await);
    assert_eq!(app.scheduler.stats(), Default::default());
    Ok(())
}

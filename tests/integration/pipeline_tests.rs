use super::*;
use price_sentinel::models::{ProductStatus, TriggerReason};
use rust_decimal::Decimal;
use std::str::FromStr;

const ECHO_URL: &str = "https://www.amazon.com/dp/B08N5WRWNW";
const KINDLE_URL: &str = "https://www.amazon.com/dp/B09SWW583J";

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[tokio::test]
async fn test_price_journey_fires_each_rule_once() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let product = app.track(ECHO_URL, Some(50)).await?;

    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$60.00"));
    app.run_cycle(0).await?;

    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.current_price, Some(dec("60.00")));
    assert_eq!(stored.title.as_deref(), Some("Echo Dot"));
    assert!(app.notifier.events().is_empty());

    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$55.00"));
    app.run_cycle(7).await?;

    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$48.00"));
    app.run_cycle(14).await?;

    // Still below target: no second alert, but the snapshot is kept
    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$47.00"));
    app.run_cycle(21).await?;

    let events = app.notifier.events();
    let reasons: Vec<TriggerReason> = events.iter().map(|e| e.trigger_reason).collect();
    assert_eq!(reasons, vec![TriggerReason::NewLow, TriggerReason::TargetReached]);
    assert_eq!(events[1].old_price, Some(dec("55.00")));
    assert_eq!(events[1].new_price, dec("48.00"));
    assert_eq!(events[1].dedup_key, format!("{}:target_reached", product.id));

    let history = app.products.price_history(&product.id).await?;
    let prices: Vec<Decimal> = history.iter().map(|s| s.price).collect();
    assert_eq!(prices, vec![dec("60.00"), dec("55.00"), dec("48.00"), dec("47.00")]);

    let stats = app.products.get_product_stats(&product.id).await?;
    assert_eq!(stats.total_checks, 4);
    assert_eq!(stats.lowest_price, Some(dec("47.00")));
    assert_eq!(stats.highest_price, Some(dec("60.00")));
    Ok(())
}

#[tokio::test]
async fn test_new_low_and_percent_drop_without_target() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let product = app.track(KINDLE_URL, None).await?;

    for (offset, price) in [(0, "$40.00"), (7, "$39.99"), (14, "$50.00"), (21, "$44.00")] {
        app.fetcher.serve(KINDLE_URL, amazon_page("Kindle", price));
        app.run_cycle(offset).await?;
    }

    let events = app.notifier.events();
    assert_eq!(events.len(), 2);

    assert_eq!(events[0].trigger_reason, TriggerReason::NewLow);
    assert_eq!(events[0].old_price, Some(dec("40.00")));
    assert_eq!(events[0].new_price, dec("39.99"));

    // 50 -> 44 is a 12% drop but not below the 39.99 low
    assert_eq!(events[1].trigger_reason, TriggerReason::PercentDrop);
    assert_eq!(events[1].old_price, Some(dec("50.00")));
    assert_eq!(events[1].percent_change, Some(dec("-12")));
    assert!(events.iter().all(|e| e.product_id == product.id));
    Ok(())
}

#[tokio::test]
async fn test_zero_price_is_a_parse_failure() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let product = app.track(ECHO_URL, Some(50)).await?;

    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$0.00"));
    app.run_cycle(0).await?;

    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.consecutive_failure_count, 1);
    assert_eq!(stored.current_price, None);
    assert!(stored.last_error.is_some());
    assert!(app.products.price_history(&product.id).await?.is_empty());

    // One retry for parse errors, and the proxies are not blamed for either
    assert_eq!(app.fetcher.calls(ECHO_URL), 2);
    assert_eq!(app.controller.pool().stats().total_failures, 0);
    assert!(app.notifier.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_repeated_blocking_flags_product_until_resumed() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let product = app.track(ECHO_URL, None).await?;

    app.fetcher.fail(
        ECHO_URL,
        FetchError::Blocked {
            reason: "captcha challenge".to_string(),
        },
    );

    app.run_cycle(0).await?;
    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.status, ProductStatus::Active);
    assert_eq!(stored.consecutive_failure_count, 1);

    app.run_cycle(7).await?;
    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.status, ProductStatus::Error);
    assert_eq!(stored.consecutive_failure_count, 2);

    // Errored products are left alone by the scheduler
    let calls = app.fetcher.calls(ECHO_URL);
    app.run_cycle(14).await?;
    assert_eq!(app.fetcher.calls(ECHO_URL), calls);

    let resumed = app.products.resume_product(&product.id).await?;
    assert_eq!(resumed.status, ProductStatus::Active);
    assert_eq!(resumed.consecutive_failure_count, 0);

    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$45.00"));
    app.run_cycle(0).await?;

    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.status, ProductStatus::Active);
    assert_eq!(stored.current_price, Some(dec("45.00")));
    assert_eq!(stored.last_error, None);
    Ok(())
}

#[tokio::test]
async fn test_empty_pool_defers_without_penalty() -> anyhow::Result<()> {
    let mut config = get_test_config();
    config.proxies.endpoints.clear();
    let app = TestApp::with_config(config).await?;
    let product = app.track(ECHO_URL, None).await?;
    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$45.00"));

    app.run_cycle(0).await?;
    app.run_cycle(0).await?;

    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.last_checked, None);
    assert_eq!(stored.consecutive_failure_count, 0);
    assert_eq!(stored.status, ProductStatus::Active);
    assert_eq!(app.fetcher.calls(ECHO_URL), 0);
    assert_eq!(app.scheduler.stats().capacity_deferred, 2);
    Ok(())
}

#[tokio::test]
async fn test_one_failing_product_does_not_stop_others() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let broken = app.track(ECHO_URL, None).await?;
    let healthy = app.track(KINDLE_URL, None).await?;

    app.fetcher.fail(ECHO_URL, FetchError::Timeout);
    app.fetcher.serve(KINDLE_URL, amazon_page("Kindle", "$89.99"));
    app.run_cycle(0).await?;

    let broken = app.products.get_product(&broken.id).await?;
    let healthy = app.products.get_product(&healthy.id).await?;
    assert_eq!(broken.consecutive_failure_count, 1);
    assert_eq!(healthy.current_price, Some(dec("89.99")));

    let stats = app.scheduler.stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.exhausted, 1);
    Ok(())
}

#[tokio::test]
async fn test_paused_product_is_never_scraped() -> anyhow::Result<()> {
    let app = TestApp::new().await?;
    let product = app.track(ECHO_URL, Some(50)).await?;
    app.products.pause_product(&product.id).await?;
    app.fetcher.serve(ECHO_URL, amazon_page("Echo Dot", "$45.00"));

    app.run_cycle(0).await?;
    app.run_cycle(24).await?;

    assert_eq!(app.fetcher.calls(ECHO_URL), 0);
    let stored = app.products.get_product(&product.id).await?;
    assert_eq!(stored.status, ProductStatus::Paused);
    assert_eq!(stored.current_price, None);
    Ok(())
}

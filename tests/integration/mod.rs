// Integration tests for price-sentinel
// These tests drive the whole pipeline against SQLite with a scripted fetcher

pub mod pipeline_tests;
pub mod scheduler_tests;
pub mod storage_tests;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use price_sentinel::{
    config::{DatabaseConfig, ProxyEndpointConfig},
    models::{AlertEvent, NewProduct, Product, ProxyKind},
    plugins::{Notifier, ParserRegistry},
    storage::{SqliteStorage, Storage},
    AlertEngine, AlertPolicy, AppConfig, AppError, FetchRequest, Fetcher, ProductManager, ProxyPool, RawContent,
    RetryController, RetryPolicy, Scheduler,
};
use price_sentinel::utils::FetchError;

/// Test configuration for integration tests
pub fn get_test_config() -> AppConfig {
    let mut config = AppConfig::default();

    config.database = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    };

    config.scraper.max_attempts = 2;
    config.scraper.backoff_base_ms = 1;
    config.scraper.backoff_cap_ms = 5;
    config.scraper.attempt_timeout_secs = 2;

    config.proxies.failure_threshold = 5;
    config.proxies.endpoints = (1..=3)
        .map(|i| ProxyEndpointConfig {
            endpoint: format!("http://proxy-{}.test:8080", i),
            kind: if i == 1 { ProxyKind::Residential } else { ProxyKind::Datacenter },
        })
        .collect();

    config.scheduler.tick_interval_secs = 1;
    config.scheduler.job_budget_secs = 10;
    config.scheduler.failure_threshold = 2;

    config
}

/// Create a migrated in-memory database
pub async fn create_test_db(config: &AppConfig) -> anyhow::Result<SqliteStorage> {
    Ok(SqliteStorage::connect(&config.database).await?)
}

pub fn amazon_page(title: &str, price: &str) -> String {
    format!(
        r#"<html><body>
            <span id="productTitle">{}</span>
            <div id="corePrice_feature_div"><span class="a-offscreen">{}</span></div>
            <div id="availability"><span>In Stock</span></div>
        </body></html>"#,
        title, price
    )
}

/// Serves whatever response is currently configured for a URL.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, Result<String, FetchError>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl ScriptedFetcher {
    pub fn serve(&self, url: &str, body: String) {
        self.responses.lock().unwrap().insert(url.to_string(), Ok(body));
    }

    pub fn fail(&self, url: &str, error: FetchError) {
        self.responses.lock().unwrap().insert(url.to_string(), Err(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest, _proxy: &str) -> Result<RawContent, FetchError> {
        *self.calls.lock().unwrap().entry(request.url.clone()).or_default() += 1;
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Network("no scripted response".to_string())));

        response.map(|body| RawContent {
            body,
            final_url: request.url.clone(),
            status: 200,
            elapsed: Duration::from_millis(5),
        })
    }
}

/// Keeps every delivered alert for inspection.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AppError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Fully wired pipeline with fakes at the network and notification edges.
pub struct TestApp {
    pub config: AppConfig,
    pub storage: Arc<dyn Storage>,
    pub products: ProductManager,
    pub fetcher: Arc<ScriptedFetcher>,
    pub notifier: Arc<RecordingNotifier>,
    pub controller: Arc<RetryController>,
    pub engine: Arc<AlertEngine>,
    pub scheduler: Scheduler,
}

impl TestApp {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(get_test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> anyhow::Result<Self> {
        let storage: Arc<dyn Storage> = Arc::new(create_test_db(&config).await?);
        let fetcher = Arc::new(ScriptedFetcher::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let mut policy = RetryPolicy::from(&config.scraper);
        policy.jitter = false;
        let controller = Arc::new(RetryController::new(
            ProxyPool::from_config(&config.proxies),
            fetcher.clone(),
            Arc::new(ParserRegistry::new()),
            policy,
        ));
        let engine = Arc::new(AlertEngine::new(
            Arc::clone(&storage),
            notifier.clone(),
            AlertPolicy::from(&config.alerts),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&storage),
            Arc::clone(&controller),
            Arc::clone(&engine),
            config.scheduler.clone(),
        );

        Ok(Self {
            products: ProductManager::new(Arc::clone(&storage)),
            config,
            storage,
            fetcher,
            notifier,
            controller,
            engine,
            scheduler,
        })
    }

    pub async fn track(&self, url: &str, target: Option<i64>) -> anyhow::Result<Product> {
        Ok(self
            .products
            .track_product(NewProduct {
                url: url.to_string(),
                marketplace: None,
                target_price: target.map(rust_decimal::Decimal::from),
                check_interval_hours: 6,
            })
            .await?)
    }

    /// One tick at `now + offset_hours`, then wait for its jobs and deliveries.
    pub async fn run_cycle(&self, offset_hours: i64) -> anyhow::Result<()> {
        self.scheduler
            .tick_at(chrono::Utc::now() + chrono::Duration::hours(offset_hours))
            .await?;
        self.scheduler.drain(Duration::from_secs(10)).await;
        self.engine.flush().await;
        Ok(())
    }
}

/// Helper to wait for async operations
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout_seconds: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(timeout_seconds);

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    false
}

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use reqwest::{header, Client, Proxy, StatusCode};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ScraperConfig;
use crate::models::{Marketplace, Product};
use crate::plugins::ParserRegistry;
use crate::utils::error::FetchError;

/// Bot-wall fingerprints seen on otherwise-successful responses, lowercase.
const BLOCK_MARKERS: &[&str] = &[
    "enter the characters you see below",
    "robot check",
    "/errors/validatecaptcha",
    "pardon our interruption",
    "captcha-delivery.com",
    "slide to verify",
    "/punish?x5secdata",
];

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub marketplace: Marketplace,
    pub timeout: Duration,
    /// Only honored by the browser fetcher.
    pub wait_for_selector: Option<String>,
}

impl FetchRequest {
    pub fn for_product(product: &Product, parsers: &ParserRegistry, timeout: Duration) -> Self {
        Self {
            url: product.url.clone(),
            marketplace: product.marketplace,
            timeout,
            wait_for_selector: parsers
                .parser_for(product.marketplace)
                .ready_selector()
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawContent {
    pub body: String,
    pub final_url: String,
    pub status: u16,
    pub elapsed: Duration,
}

/// Retrieves one product page through one proxy. A single call is a single attempt;
/// retrying is the caller's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest, proxy: &str) -> Result<RawContent, FetchError>;
}

/// Map an HTTP status plus body to success or a classified fetch failure.
pub fn classify_response(status: StatusCode, body: &str) -> Result<(), FetchError> {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::Blocked {
            reason: format!("HTTP {}", status.as_u16()),
        });
    }

    if let Some(marker) = find_block_marker(body) {
        return Err(FetchError::Blocked {
            reason: format!("challenge page ({})", marker),
        });
    }

    if !status.is_success() {
        return Err(FetchError::Network(format!("HTTP {}", status.as_u16())));
    }

    Ok(())
}

fn find_block_marker(body: &str) -> Option<&'static str> {
    let lowered = body.to_lowercase();
    BLOCK_MARKERS.iter().copied().find(|marker| lowered.contains(marker))
}

/// Plain HTTP fetcher for server-rendered marketplaces. One reqwest client is kept per
/// proxy endpoint.
pub struct HttpFetcher {
    clients: Mutex<HashMap<String, Client>>,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
}

impl HttpFetcher {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            user_agents: config.user_agents.clone(),
            next_agent: AtomicUsize::new(0),
        }
    }

    fn user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        Some(&self.user_agents[index])
    }

    fn client_for(&self, proxy: &str) -> Result<Client, FetchError> {
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }

        let proxy_config = Proxy::all(proxy).map_err(|e| FetchError::Network(format!("invalid proxy {}: {}", proxy, e)))?;
        let client = Client::builder()
            .proxy(proxy_config)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    async fn send(&self, client: Client, request: &FetchRequest) -> Result<RawContent, FetchError> {
        let start_time = Instant::now();

        let mut builder = client
            .get(&request.url)
            .timeout(request.timeout)
            .header(header::ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        if let Some(user_agent) = self.user_agent() {
            builder = builder.header(header::USER_AGENT, user_agent);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(map_reqwest_error)?;

        classify_response(status, &body)?;

        Ok(RawContent {
            body,
            final_url,
            status: status.as_u16(),
            elapsed: start_time.elapsed(),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest, proxy: &str) -> Result<RawContent, FetchError> {
        let client = self.client_for(proxy)?;

        // The per-request timeout covers the response; this one also covers the body read
        match tokio::time::timeout(request.timeout, self.send(client, request)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}

/// Headless Chrome fetcher for client-rendered marketplaces. Chrome takes its proxy as a
/// launch flag, so every fetch launches a short-lived browser bound to that proxy.
pub struct BrowserFetcher {
    chrome_path: Option<String>,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
}

/// Everything one browser render needs, moved onto the blocking thread.
struct BrowserSession {
    proxy_server: String,
    credentials: Option<(String, String)>,
    chrome_path: Option<String>,
    user_agent: Option<String>,
}

/// Raised when the async side gives up on a render, including when its future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl BrowserFetcher {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            chrome_path: config.chrome_path.clone(),
            user_agents: config.user_agents.clone(),
            next_agent: AtomicUsize::new(0),
        }
    }

    fn user_agent(&self) -> Option<String> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        Some(self.user_agents[index].clone())
    }

    /// Runs on a blocking thread. `cancelled` is checked between browser steps so an
    /// abandoned render tears its browser down instead of idling on.
    fn render(request: FetchRequest, session: BrowserSession, cancelled: &AtomicBool) -> Result<RawContent, FetchError> {
        let checkpoint = || {
            if cancelled.load(Ordering::Relaxed) {
                Err(FetchError::Timeout)
            } else {
                Ok(())
            }
        };
        checkpoint()?;

        let start_time = Instant::now();
        let browser_error = |e: anyhow::Error| FetchError::Network(format!("browser: {}", e));

        let mut launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false) // Often needed in containerized environments
            .proxy_server(Some(session.proxy_server.as_str()))
            .idle_browser_timeout(request.timeout)
            .args(vec![
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-extensions"),
            ])
            .build()
            .map_err(|e| FetchError::Network(format!("launch options: {}", e)))?;
        if let Some(path) = session.chrome_path {
            launch_options.path = Some(std::path::PathBuf::from(path));
        }

        let browser = Browser::new(launch_options).map_err(browser_error)?;
        checkpoint()?;
        let tab = browser.new_tab().map_err(browser_error)?;
        tab.set_default_timeout(request.timeout);
        if let Some(user_agent) = session.user_agent {
            tab.set_user_agent(&user_agent, None, None).map_err(browser_error)?;
        }

        // Chrome ignores credentials in --proxy-server; answer the 407 challenge instead
        if let Some((username, password)) = session.credentials {
            tab.enable_fetch(None, Some(true)).map_err(browser_error)?;
            tab.authenticate(Some(username), Some(password)).map_err(browser_error)?;
        }

        tab.navigate_to(&request.url).map_err(browser_error)?;
        tab.wait_until_navigated().map_err(|_| FetchError::Timeout)?;
        checkpoint()?;

        let navigation = tab
            .evaluate(NAVIGATION_STATUS_SCRIPT, false)
            .ok()
            .and_then(|object| object.value);
        let status = navigation_status(navigation.as_ref());
        let content = tab.get_content().map_err(browser_error)?;
        classify_response(status, &content)?;

        if let Some(selector) = &request.wait_for_selector {
            checkpoint()?;
            tab.wait_for_element_with_custom_timeout(selector, request.timeout)
                .map_err(|_| FetchError::Timeout)?;
        }

        let body = tab.get_content().map_err(browser_error)?;
        let final_url = {
            let url = tab.get_url();
            if url.is_empty() { request.url.clone() } else { url }
        };
        let _ = tab.close(true);

        Ok(RawContent {
            body,
            final_url,
            status: status.as_u16(),
            elapsed: start_time.elapsed(),
        })
    }
}

/// HTTP status of the main document, from the Navigation Timing entry.
const NAVIGATION_STATUS_SCRIPT: &str =
    "(performance.getEntriesByType('navigation')[0] || {}).responseStatus || 0";

/// Chrome reports 0 when the status is unknown (cached or pre-109 builds); treat that
/// as a plain 200 and let the content decide.
fn navigation_status(value: Option<&serde_json::Value>) -> StatusCode {
    value
        .and_then(serde_json::Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .filter(|code| *code != 0)
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK)
}

/// Chrome's `--proxy-server` flag takes `scheme://host:port` without credentials.
pub fn chrome_proxy_server(endpoint: &str) -> String {
    match url::Url::parse(endpoint) {
        Ok(parsed) => match (parsed.host_str(), parsed.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", parsed.scheme(), host, port),
            (Some(host), None) => format!("{}://{}", parsed.scheme(), host),
            _ => endpoint.to_string(),
        },
        Err(_) => endpoint.to_string(),
    }
}

/// `user:pass` from a proxy endpoint, as written in the URL.
pub fn proxy_credentials(endpoint: &str) -> Option<(String, String)> {
    let parsed = url::Url::parse(endpoint).ok()?;
    if parsed.username().is_empty() {
        return None;
    }
    Some((parsed.username().to_string(), parsed.password().unwrap_or_default().to_string()))
}

#[async_trait]
impl Fetcher for BrowserFetcher {
    async fn fetch(&self, request: &FetchRequest, proxy: &str) -> Result<RawContent, FetchError> {
        let request_owned = request.clone();
        let session = BrowserSession {
            proxy_server: chrome_proxy_server(proxy),
            credentials: proxy_credentials(proxy),
            chrome_path: self.chrome_path.clone(),
            user_agent: self.user_agent(),
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let _cancel = CancelOnDrop(Arc::clone(&cancelled));

        // Launch, navigation and the selector wait are all bounded by the same budget
        let budget = request.timeout * 2;
        let task = tokio::task::spawn_blocking(move || Self::render(request_owned, session, &cancelled));

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(FetchError::Network(format!("browser task failed: {}", join_error))),
            Err(_) => Err(FetchError::Timeout),
        }
    }
}

/// Routes each request to the plain HTTP fetcher or the browser, depending on whether
/// the marketplace renders prices client-side.
pub struct MarketplaceFetcher {
    http: HttpFetcher,
    browser: Option<BrowserFetcher>,
}

impl MarketplaceFetcher {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            http: HttpFetcher::new(config),
            browser: config.browser_enabled.then(|| BrowserFetcher::new(config)),
        }
    }
}

#[async_trait]
impl Fetcher for MarketplaceFetcher {
    async fn fetch(&self, request: &FetchRequest, proxy: &str) -> Result<RawContent, FetchError> {
        match &self.browser {
            Some(browser) if request.marketplace.requires_browser() => {
                debug!(url = %request.url, "Fetching with headless browser");
                browser.fetch(request, proxy).await
            }
            _ => self.http.fetch(request, proxy).await,
        }
    }
}

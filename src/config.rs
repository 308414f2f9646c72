use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::models::{Marketplace, ProxyKind};

/// Policy defaults. Every one of these can be overridden from configuration.
pub mod defaults {
    pub const CURRENCY: &str = "USD";
    pub const CHECK_INTERVAL_HOURS: u32 = 6;

    pub const DATABASE_URL: &str = "sqlite://data/price-sentinel.db?mode=rwc";
    pub const DATABASE_MAX_CONNECTIONS: u32 = 5;

    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BACKOFF_BASE_MS: u64 = 500;
    pub const BACKOFF_CAP_MS: u64 = 30_000;
    pub const ATTEMPT_TIMEOUT_SECS: u64 = 30;
    pub const MAX_PARSE_RETRIES: u32 = 1;

    pub const PROXY_FAILURE_THRESHOLD: u32 = 3;
    pub const PROXY_COOLDOWN_BASE_SECS: u64 = 60;
    pub const PROXY_COOLDOWN_CAP_SECS: u64 = 1_800;
    pub const PROXY_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
    pub const PROXY_HEALTH_CHECK_TIMEOUT_SECS: u64 = 10;
    pub const PROXY_HEALTH_CHECK_URL: &str = "http://checkip.amazonaws.com";

    pub const TICK_INTERVAL_SECS: u64 = 30;
    pub const GLOBAL_CONCURRENCY: usize = 50;
    pub const MARKETPLACE_CONCURRENCY: usize = 10;
    pub const JOB_BUDGET_SECS: u64 = 180;
    pub const PRODUCT_FAILURE_THRESHOLD: u32 = 3;
    pub const SHUTDOWN_GRACE_SECS: u64 = 10;

    pub const PERCENT_DROP_THRESHOLD: f64 = 10.0;
    pub const DEDUP_WINDOW_HOURS: i64 = 24;

    pub const METRICS_PORT: u16 = 9001;
    pub const LOG_FILTER: &str = "price_sentinel=info";

    pub const USER_AGENTS: [&str; 3] = [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    ];
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scraper: ScraperConfig,
    pub proxies: ProxyPoolConfig,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertConfig,
    pub notifications: NotificationsConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: defaults::DATABASE_URL.to_string(),
            max_connections: defaults::DATABASE_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub attempt_timeout_secs: u64,
    pub max_parse_retries: u32,
    pub user_agents: Vec<String>,
    pub browser_enabled: bool,
    pub chrome_path: Option<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            backoff_base_ms: defaults::BACKOFF_BASE_MS,
            backoff_cap_ms: defaults::BACKOFF_CAP_MS,
            attempt_timeout_secs: defaults::ATTEMPT_TIMEOUT_SECS,
            max_parse_retries: defaults::MAX_PARSE_RETRIES,
            user_agents: defaults::USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            browser_enabled: true,
            chrome_path: None,
        }
    }
}

impl ScraperConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyEndpointConfig {
    pub endpoint: String,
    pub kind: ProxyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    /// Consecutive failures before a proxy is put into cooldown.
    pub failure_threshold: u32,
    pub cooldown_base_secs: u64,
    pub cooldown_cap_secs: u64,
    /// Zero disables the periodic health check.
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub health_check_url: String,
    pub endpoints: Vec<ProxyEndpointConfig>,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::PROXY_FAILURE_THRESHOLD,
            cooldown_base_secs: defaults::PROXY_COOLDOWN_BASE_SECS,
            cooldown_cap_secs: defaults::PROXY_COOLDOWN_CAP_SECS,
            health_check_interval_secs: defaults::PROXY_HEALTH_CHECK_INTERVAL_SECS,
            health_check_timeout_secs: defaults::PROXY_HEALTH_CHECK_TIMEOUT_SECS,
            health_check_url: defaults::PROXY_HEALTH_CHECK_URL.to_string(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub global_concurrency: usize,
    pub default_marketplace_concurrency: usize,
    pub marketplace_concurrency: HashMap<Marketplace, usize>,
    /// Wall-clock budget for one job (all attempts plus backoff).
    pub job_budget_secs: u64,
    /// Consecutive exhausted jobs before a product is flagged `error`.
    pub failure_threshold: u32,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: defaults::TICK_INTERVAL_SECS,
            global_concurrency: defaults::GLOBAL_CONCURRENCY,
            default_marketplace_concurrency: defaults::MARKETPLACE_CONCURRENCY,
            marketplace_concurrency: HashMap::new(),
            job_budget_secs: defaults::JOB_BUDGET_SECS,
            failure_threshold: defaults::PRODUCT_FAILURE_THRESHOLD,
            shutdown_grace_secs: defaults::SHUTDOWN_GRACE_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn concurrency_for(&self, marketplace: Marketplace) -> usize {
        self.marketplace_concurrency
            .get(&marketplace)
            .copied()
            .unwrap_or(self.default_marketplace_concurrency)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn job_budget(&self) -> Duration {
        Duration::from_secs(self.job_budget_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum drop versus the previous snapshot, in percent.
    pub percent_drop_threshold: f64,
    pub dedup_window_hours: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            percent_drop_threshold: defaults::PERCENT_DROP_THRESHOLD,
            dedup_window_hours: defaults::DEDUP_WINDOW_HOURS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub discord: DiscordConfig,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub webhook_url: Option<String>,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            username: "Price Sentinel".to_string(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
    pub from_name: String,
    pub recipients: Vec<String>,
    pub use_tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            username: None,
            password: None,
            from_address: None,
            from_name: "Price Sentinel".to_string(),
            recipients: Vec::new(),
            use_tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: defaults::METRICS_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    /// When set, logs are also written to a daily-rolling file in this directory.
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: defaults::LOG_FILTER.to_string(),
            directory: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default configuration
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific config
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local config (ignored by git)
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix "SENTINEL__"
            .add_source(Environment::with_prefix("SENTINEL").separator("__"))
            .build()?;

        Self::finish(s.try_deserialize()?)
    }

    /// Load one explicit file, still honouring environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("SENTINEL").separator("__"))
            .build()?;

        Self::finish(s.try_deserialize()?)
    }

    fn finish(mut config: AppConfig) -> Result<Self, ConfigError> {
        // Add Chrome path from environment if not set
        if config.scraper.chrome_path.is_none() {
            config.scraper.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Message("Database max_connections must be greater than 0".into()));
        }

        // Validate scraper configuration
        if self.scraper.max_attempts == 0 {
            return Err(ConfigError::Message("Scraper max_attempts must be greater than 0".into()));
        }

        if self.scraper.attempt_timeout_secs == 0 {
            return Err(ConfigError::Message("Scraper attempt_timeout_secs must be greater than 0".into()));
        }

        if self.scraper.backoff_base_ms > self.scraper.backoff_cap_ms {
            return Err(ConfigError::Message("Scraper backoff_base_ms cannot exceed backoff_cap_ms".into()));
        }

        if self.scraper.user_agents.is_empty() {
            return Err(ConfigError::Message("Scraper user_agents must not be empty".into()));
        }

        // Validate proxy pool configuration
        if self.proxies.failure_threshold == 0 {
            return Err(ConfigError::Message("Proxy failure_threshold must be greater than 0".into()));
        }

        if self.proxies.cooldown_base_secs > self.proxies.cooldown_cap_secs {
            return Err(ConfigError::Message("Proxy cooldown_base_secs cannot exceed cooldown_cap_secs".into()));
        }

        if self.proxies.health_check_interval_secs > 0 {
            if self.proxies.health_check_timeout_secs == 0 {
                return Err(ConfigError::Message("Proxy health_check_timeout_secs must be greater than 0".into()));
            }
            if Url::parse(&self.proxies.health_check_url).is_err() {
                return Err(ConfigError::Message("Invalid proxy health_check_url".into()));
            }
        }

        let mut seen = HashSet::new();
        for proxy in &self.proxies.endpoints {
            if Url::parse(&proxy.endpoint).is_err() {
                return Err(ConfigError::Message(format!("Invalid proxy endpoint: {}", proxy.endpoint)));
            }
            if !seen.insert(proxy.endpoint.as_str()) {
                return Err(ConfigError::Message(format!("Duplicate proxy endpoint: {}", proxy.endpoint)));
            }
        }

        // Validate scheduler configuration
        if self.scheduler.global_concurrency == 0 || self.scheduler.default_marketplace_concurrency == 0 {
            return Err(ConfigError::Message("Scheduler concurrency caps must be greater than 0".into()));
        }

        if self.scheduler.marketplace_concurrency.values().any(|cap| *cap == 0) {
            return Err(ConfigError::Message("Scheduler concurrency caps must be greater than 0".into()));
        }

        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::Message("Scheduler tick_interval_secs must be greater than 0".into()));
        }

        if self.scheduler.failure_threshold == 0 {
            return Err(ConfigError::Message("Scheduler failure_threshold must be greater than 0".into()));
        }

        if self.scheduler.job_budget_secs < self.scraper.attempt_timeout_secs {
            return Err(ConfigError::Message("Scheduler job_budget_secs must cover at least one attempt timeout".into()));
        }

        // Validate alert configuration
        if !(self.alerts.percent_drop_threshold > 0.0 && self.alerts.percent_drop_threshold < 100.0) {
            return Err(ConfigError::Message("Alert percent_drop_threshold must be between 0 and 100".into()));
        }

        if self.alerts.dedup_window_hours < 0 {
            return Err(ConfigError::Message("Alert dedup_window_hours cannot be negative".into()));
        }

        if let Some(webhook) = &self.notifications.discord.webhook_url {
            if Url::parse(webhook).is_err() {
                return Err(ConfigError::Message("Invalid Discord webhook URL".into()));
            }
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::Message("Metrics port must be greater than 0".into()));
        }

        Ok(())
    }
}

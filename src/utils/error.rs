use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notification error: {notifier}: {message}")]
    Notification { notifier: String, message: String },

    #[error("Unsupported marketplace URL: {0}")]
    UnsupportedMarketplace(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(format!("{}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure of a single fetch attempt. All variants are retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("blocked by marketplace: {reason}")]
    Blocked { reason: String },
}

/// The fetched content did not yield a usable price.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no price found in page")]
    MissingPrice,

    #[error("unparseable price text: {0:?}")]
    InvalidPrice(String),

    #[error("price {0} is not a positive amount")]
    NonPositivePrice(Decimal),
}

/// No proxy is currently eligible. Transient capacity pressure, not a product failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("proxy pool exhausted")]
pub struct PoolExhausted;

/// Job-level outcome once the retry policy gives up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminalFailure {
    #[error("scrape failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("no proxy capacity available")]
    Capacity,
}

impl TerminalFailure {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalFailure::Exhausted { .. } => "exhausted",
            TerminalFailure::Capacity => "capacity",
        }
    }
}

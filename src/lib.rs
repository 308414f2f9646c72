pub mod alert_engine;
pub mod config;
pub mod fetcher;
pub mod models;
pub mod plugins;
pub mod product_manager;
pub mod proxy_pool;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use alert_engine::{AlertEngine, AlertPolicy};
pub use config::AppConfig;
pub use fetcher::{FetchRequest, Fetcher, MarketplaceFetcher, RawContent};
pub use product_manager::ProductManager;
pub use proxy_pool::ProxyPool;
pub use retry::{RetryController, RetryPolicy};
pub use scheduler::Scheduler;
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;

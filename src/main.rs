use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use price_sentinel::config::LoggingConfig;
use price_sentinel::models::{Marketplace, NewProduct};
use price_sentinel::plugins::{ParserRegistry, PluginManager};
use price_sentinel::proxy_pool::HealthCheck;
use price_sentinel::storage::{SqliteStorage, Storage};
use price_sentinel::{
    AlertEngine, AlertPolicy, AppConfig, Fetcher, MarketplaceFetcher, ProductManager, ProxyPool, RetryController,
    RetryPolicy, Scheduler,
};

#[derive(Parser)]
#[command(name = "price-sentinel", version, about = "Marketplace price tracking and price-drop alerts")]
struct Cli {
    /// Configuration file; defaults to the config/ directory layering
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Run {
        /// Run a single tick, wait for its jobs and exit
        #[arg(long)]
        once: bool,
    },
    /// Start tracking a product URL
    Track {
        url: String,
        #[arg(long)]
        target: Option<Decimal>,
        #[arg(long)]
        marketplace: Option<Marketplace>,
        #[arg(long, default_value_t = 6)]
        interval_hours: u32,
    },
    Pause {
        id: String,
    },
    /// Resume a paused product, or re-trigger one in error status
    Resume {
        id: String,
    },
    List,
    History {
        id: String,
    },
}

fn init_tracing(config: &LoggingConfig, log_dir: Option<PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.filter))?;

    let directory = log_dir.or_else(|| config.directory.as_ref().map(PathBuf::from));
    let (file_layer, guard) = match directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "price-sentinel.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::from_env(),
    }
    .context("failed to load configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(&config.logging, cli.log_dir.clone())?;

    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::connect(&config.database).await?);
    let products = ProductManager::new(Arc::clone(&storage));

    match cli.command.unwrap_or(Command::Run { once: false }) {
        Command::Run { once } => run(config, storage, once).await?,
        Command::Track {
            url,
            target,
            marketplace,
            interval_hours,
        } => {
            let product = products
                .track_product(NewProduct {
                    url,
                    marketplace,
                    target_price: target,
                    check_interval_hours: interval_hours,
                })
                .await?;
            println!("{}\t{}\t{}", product.id, product.marketplace, product.url);
        }
        Command::Pause { id } => {
            products.pause_product(&id).await?;
            println!("{} paused", id);
        }
        Command::Resume { id } => {
            products.resume_product(&id).await?;
            println!("{} resumed", id);
        }
        Command::List => {
            for product in products.list_products().await? {
                println!(
                    "{}\t{:?}\t{}\t{}\t{}",
                    product.id,
                    product.status,
                    product.marketplace,
                    product.current_price.map_or_else(|| "-".to_string(), |p| format!("{} {}", p, product.currency)),
                    product.url
                );
            }
        }
        Command::History { id } => {
            for snapshot in products.price_history(&id).await? {
                println!(
                    "{}\t{} {}\t{}",
                    snapshot.scraped_at.to_rfc3339(),
                    snapshot.price,
                    snapshot.currency,
                    if snapshot.in_stock { "in stock" } else { "out of stock" }
                );
            }
        }
    }

    Ok(())
}

async fn run(config: AppConfig, storage: Arc<dyn Storage>, once: bool) -> Result<()> {
    info!("Starting price-sentinel v{}", env!("CARGO_PKG_VERSION"));

    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics.port))
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(port = config.metrics.port, "Prometheus exporter listening");
    }

    let pool = ProxyPool::from_config(&config.proxies);
    if pool.stats().total == 0 {
        warn!("No proxies configured; every scrape job will be deferred");
    }

    let fetcher: Arc<dyn Fetcher> = Arc::new(MarketplaceFetcher::new(&config.scraper));
    let controller = Arc::new(RetryController::new(
        pool,
        fetcher,
        Arc::new(ParserRegistry::new()),
        RetryPolicy::from(&config.scraper),
    ));

    let plugins = PluginManager::new();
    plugins.initialize_default_plugins(&config.notifications).await?;
    info!(notifiers = ?plugins.list_notifiers().await, "Notification channels ready");

    let engine = Arc::new(AlertEngine::new(
        Arc::clone(&storage),
        Arc::new(plugins),
        AlertPolicy::from(&config.alerts),
    ));
    let mut scheduler = Scheduler::new(storage, controller, Arc::clone(&engine), config.scheduler.clone());
    if let Some(check) = HealthCheck::from_config(&config.proxies) {
        scheduler = scheduler.with_health_check(check);
    }
    let grace = Duration::from_secs(config.scheduler.shutdown_grace_secs);

    if once {
        let summary = scheduler.tick().await?;
        info!(due = summary.due, dispatched = summary.dispatched, "Single tick dispatched");
        scheduler.drain(config.scheduler.job_budget() + grace).await;
    } else {
        scheduler.start()?;
        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");
        scheduler.stop().await;
        if !scheduler.drain(grace).await {
            warn!("Some scrape jobs were aborted during shutdown");
        }
    }

    engine.flush().await;
    info!(stats = ?scheduler.stats(), "Scheduler stopped");
    Ok(())
}

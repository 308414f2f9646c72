use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::alert_engine::AlertEngine;
use crate::config::SchedulerConfig;
use crate::models::{Marketplace, Product, ScrapedRecord};
use crate::proxy_pool::HealthCheck;
use crate::retry::RetryController;
use crate::storage::Storage;
use crate::utils::error::{AppError, Result, TerminalFailure};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub exhausted: u64,
    pub capacity_deferred: u64,
    pub skipped_in_flight: u64,
    pub in_flight: usize,
}

/// What a single `tick` found and handed off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub dispatched: usize,
    pub skipped_in_flight: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a product as owned by a running job; released on drop, including when the job
/// is aborted.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    product_id: String,
}

impl InFlightGuard {
    fn claim(in_flight: &Arc<Mutex<HashSet<String>>>, product_id: &str) -> Option<Self> {
        if !lock(in_flight).insert(product_id.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: Arc::clone(in_flight),
            product_id: product_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.product_id);
    }
}

struct SchedulerInner {
    storage: Arc<dyn Storage>,
    controller: Arc<RetryController>,
    engine: Arc<AlertEngine>,
    config: SchedulerConfig,
    global_slots: Arc<Semaphore>,
    marketplace_slots: HashMap<Marketplace, Arc<Semaphore>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    jobs: Mutex<JoinSet<()>>,
    stats: Mutex<SchedulerStats>,
}

impl SchedulerInner {
    async fn tick_at(inner: &Arc<Self>, now: DateTime<Utc>) -> Result<TickSummary> {
        let due = inner.storage.load_due_products(now).await?;
        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };

        {
            let mut jobs = lock(&inner.jobs);
            while let Some(finished) = jobs.try_join_next() {
                if let Err(e) = finished {
                    error!("Scrape job task failed: {}", e);
                }
            }

            // Stalest first; the semaphores queue waiters in spawn order
            for product in due {
                let Some(guard) = InFlightGuard::claim(&inner.in_flight, &product.id) else {
                    debug!(product_id = %product.id, "Job already in flight, skipping");
                    summary.skipped_in_flight += 1;
                    continue;
                };
                summary.dispatched += 1;
                jobs.spawn(Arc::clone(inner).run_job(product, guard));
            }
        }

        {
            let mut stats = lock(&inner.stats);
            stats.ticks += 1;
            stats.dispatched += summary.dispatched as u64;
            stats.skipped_in_flight += summary.skipped_in_flight as u64;
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                dispatched = summary.dispatched,
                skipped = summary.skipped_in_flight,
                "Scheduler tick"
            );
        }
        Ok(summary)
    }

    fn slots_for(&self, marketplace: Marketplace) -> Arc<Semaphore> {
        self.marketplace_slots
            .get(&marketplace)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.global_slots))
    }

    async fn run_job(self: Arc<Self>, product: Product, _guard: InFlightGuard) {
        // Marketplace slot first so a saturated site never holds global capacity
        let Ok(_marketplace_permit) = self.slots_for(product.marketplace).acquire_owned().await else {
            return;
        };
        let Ok(_global_permit) = Arc::clone(&self.global_slots).acquire_owned().await else {
            return;
        };

        let started = Instant::now();
        let budget = self.config.job_budget();
        let result = match tokio::time::timeout(budget, self.controller.execute_with_retry(&product)).await {
            Ok(job) => {
                let response_time = job.response_time;
                job.result.map(|record| (record, response_time))
            }
            Err(_) => {
                warn!(product_id = %product.id, budget_secs = budget.as_secs(), "Scrape job aborted: budget exceeded");
                Err(TerminalFailure::Exhausted {
                    attempts: 0,
                    last_error: format!("job exceeded its {}s budget", budget.as_secs()),
                })
            }
        };

        let label = match &result {
            Ok(_) => "success",
            Err(failure) => failure.label(),
        };
        counter!("scrape_jobs_total", "result" => label).increment(1);
        histogram!("scrape_job_duration_seconds").record(started.elapsed().as_secs_f64());

        if let Err(e) = self.complete(&product.id, result).await {
            error!(product_id = %product.id, "Failed to record scrape outcome: {}", e);
        }
    }

    /// Commit a finished job. The product is re-read so a pause issued while the job was
    /// running is not overwritten.
    async fn complete(
        &self,
        product_id: &str,
        result: std::result::Result<(ScrapedRecord, Option<Duration>), TerminalFailure>,
    ) -> Result<()> {
        match result {
            Ok((record, response_time)) => {
                lock(&self.stats).succeeded += 1;
                let Some(mut product) = self.storage.load_product(product_id).await? else {
                    warn!(product_id, "Product disappeared while its job was running");
                    return Ok(());
                };
                let alert = self.engine.evaluate(&mut product, &record, response_time).await?;
                info!(
                    product_id,
                    price = %record.price,
                    currency = %record.currency,
                    alert = alert.as_ref().map(|a| a.trigger_reason.as_str()),
                    "Scrape job succeeded"
                );
            }
            Err(TerminalFailure::Capacity) => {
                lock(&self.stats).capacity_deferred += 1;
                info!(product_id, "Scrape job deferred: no proxy capacity");
            }
            Err(failure) => {
                lock(&self.stats).exhausted += 1;
                let Some(mut product) = self.storage.load_product(product_id).await? else {
                    warn!(product_id, "Product disappeared while its job was running");
                    return Ok(());
                };
                let degraded = product.apply_exhausted(&failure.to_string(), self.config.failure_threshold, Utc::now());
                self.storage.save_product_state(&product).await?;

                if degraded {
                    warn!(
                        product_id,
                        failures = product.consecutive_failure_count,
                        "Product moved to error status: {}",
                        failure
                    );
                } else {
                    info!(
                        product_id,
                        failures = product.consecutive_failure_count,
                        "Scrape job failed: {}",
                        failure
                    );
                }
            }
        }
        Ok(())
    }
}

/// Periodically dispatches due products to concurrent scrape jobs, bounded by a global
/// and a per-marketplace cap. At most one job per product is in flight.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    shutdown: Arc<Notify>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    health_check: Option<HealthCheck>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        controller: Arc<RetryController>,
        engine: Arc<AlertEngine>,
        config: SchedulerConfig,
    ) -> Self {
        let marketplace_slots = Marketplace::ALL
            .iter()
            .map(|m| (*m, Arc::new(Semaphore::new(config.concurrency_for(*m)))))
            .collect();

        Self {
            inner: Arc::new(SchedulerInner {
                storage,
                controller,
                engine,
                global_slots: Arc::new(Semaphore::new(config.global_concurrency)),
                marketplace_slots,
                config,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                jobs: Mutex::new(JoinSet::new()),
                stats: Mutex::new(SchedulerStats::default()),
            }),
            shutdown: Arc::new(Notify::new()),
            loop_handle: Mutex::new(None),
            health_check: None,
        }
    }

    /// Also health-check the proxy pool on the check's interval while the loop runs.
    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Spawn the tick loop. The first tick runs immediately.
    pub fn start(&self) -> Result<()> {
        let mut handle = lock(&self.loop_handle);
        if handle.is_some() {
            return Err(AppError::Internal("scheduler is already running".to_string()));
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = Arc::clone(&self.shutdown);
        let tick_interval = inner.config.tick_interval();
        let health_check = self.health_check.clone();

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // First check one period after start; the pool starts out presumed healthy
            let health_period = health_check.as_ref().map_or(tick_interval, |check| check.interval);
            let mut health_interval =
                tokio::time::interval_at(tokio::time::Instant::now() + health_period, health_period);
            health_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut health_task: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = interval.tick() => {
                        if let Err(e) = SchedulerInner::tick_at(&inner, Utc::now()).await {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }
                    _ = health_interval.tick(), if health_check.is_some() => {
                        if health_task.as_ref().is_some_and(|task| !task.is_finished()) {
                            debug!("Previous proxy health check still running, skipping");
                            continue;
                        }
                        if let Some(check) = health_check.clone() {
                            let pool = inner.controller.pool().clone();
                            health_task = Some(tokio::spawn(async move {
                                pool.check_health(&check).await;
                            }));
                        }
                    }
                }
            }

            if let Some(task) = health_task {
                task.abort();
            }
            info!("Scheduler loop stopped");
        }));

        info!(
            tick_interval_secs = tick_interval.as_secs(),
            global_concurrency = self.inner.config.global_concurrency,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop ticking. Jobs already dispatched keep running; see [`Scheduler::drain`].
    pub async fn stop(&self) {
        let handle = lock(&self.loop_handle).take();
        if let Some(handle) = handle {
            self.shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!("Scheduler loop ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.loop_handle).is_some()
    }

    pub async fn tick(&self) -> Result<TickSummary> {
        self.tick_at(Utc::now()).await
    }

    /// Dispatch every product due at `now` that has no job in flight. Returns without
    /// waiting for the jobs.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        SchedulerInner::tick_at(&self.inner, now).await
    }

    /// Wait up to `grace` for dispatched jobs; whatever is still running afterwards is
    /// aborted. Returns `true` when every job finished on its own.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut jobs = std::mem::take(&mut *lock(&self.inner.jobs));
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = jobs.join_next().await {
                if let Err(e) = joined {
                    error!("Scrape job task failed: {}", e);
                }
            }
        })
        .await
        .is_ok();

        if !finished {
            warn!(remaining = jobs.len(), "Aborting scrape jobs still running after the grace period");
            jobs.shutdown().await;
        }
        finished
    }

    pub fn is_in_flight(&self, product_id: &str) -> bool {
        lock(&self.inner.in_flight).contains(product_id)
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = lock(&self.inner.stats).clone();
        stats.in_flight = lock(&self.inner.in_flight).len();
        stats
    }
}

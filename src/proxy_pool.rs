use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use reqwest::{header, Client, Proxy};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration as StdDuration, Instant};

use crate::config::ProxyPoolConfig;
use crate::models::{Marketplace, ProxyKind, ProxyRecord};
use crate::utils::error::PoolExhausted;

/// When and for how long a failing proxy is benched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub failure_threshold: u32,
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl CooldownPolicy {
    /// Cooldown owed after `consecutive_failures`, doubling for every failure past the
    /// threshold and capped. `None` while still under the threshold.
    pub fn cooldown(&self, consecutive_failures: u32) -> Option<Duration> {
        if consecutive_failures < self.failure_threshold {
            return None;
        }
        let excess = consecutive_failures - self.failure_threshold;
        let factor = 1u64.checked_shl(excess).unwrap_or(u64::MAX);
        let secs = self.base_secs.saturating_mul(factor).min(self.cap_secs);
        Some(Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }
}

impl From<&ProxyPoolConfig> for CooldownPolicy {
    fn from(config: &ProxyPoolConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            base_secs: config.cooldown_base_secs,
            cap_secs: config.cooldown_cap_secs,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub cooling_down: usize,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Out-of-band liveness check: a GET through each idle proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub url: String,
    pub timeout: StdDuration,
    pub interval: StdDuration,
}

impl HealthCheck {
    /// `None` when the interval is configured as zero.
    pub fn from_config(config: &ProxyPoolConfig) -> Option<Self> {
        (config.health_check_interval_secs > 0).then(|| Self {
            url: config.health_check_url.clone(),
            timeout: StdDuration::from_secs(config.health_check_timeout_secs),
            interval: StdDuration::from_secs(config.health_check_interval_secs),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Success(Option<StdDuration>),
    Failure,
    /// Returned without any verdict on the proxy's health.
    Neutral,
}

struct PoolInner {
    proxies: Mutex<Vec<ProxyRecord>>,
    policy: CooldownPolicy,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Vec<ProxyRecord>> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, endpoint: &str, outcome: Settlement, now: DateTime<Utc>) {
        let mut proxies = self.lock();
        let Some(proxy) = proxies.iter_mut().find(|p| p.endpoint == endpoint) else {
            // Removed while leased
            return;
        };
        proxy.in_use = false;

        match outcome {
            Settlement::Success(response_time) => {
                proxy.consecutive_failures = 0;
                proxy.cooldown_until = None;
                proxy.total_successes += 1;
                if let Some(response_time) = response_time {
                    proxy.record_response_time(response_time);
                }
            }
            Settlement::Failure => {
                proxy.consecutive_failures += 1;
                proxy.total_failures += 1;
                if let Some(cooldown) = self.policy.cooldown(proxy.consecutive_failures) {
                    proxy.cooldown_until = Some(now + cooldown);
                    metrics::counter!("proxy_cooldowns_total").increment(1);
                    tracing::warn!(
                        "Proxy {} cooling down for {}s after {} consecutive failures",
                        proxy.endpoint,
                        cooldown.num_seconds(),
                        proxy.consecutive_failures
                    );
                }
            }
            Settlement::Neutral => {}
        }
    }
}

/// Shared pool of outbound proxies. Cheap to clone; all clones see the same state.
///
/// A proxy is issued to one job at a time: `acquire` hands out a [`ProxyLease`] and the
/// proxy stays unavailable until the lease is reported or dropped.
#[derive(Clone)]
pub struct ProxyPool {
    inner: Arc<PoolInner>,
}

impl ProxyPool {
    pub fn new(policy: CooldownPolicy, proxies: Vec<ProxyRecord>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                proxies: Mutex::new(proxies),
                policy,
            }),
        }
    }

    pub fn from_config(config: &ProxyPoolConfig) -> Self {
        let proxies = config
            .endpoints
            .iter()
            .map(|p| ProxyRecord::new(p.endpoint.clone(), p.kind))
            .collect();
        Self::new(CooldownPolicy::from(config), proxies)
    }

    pub fn acquire(&self, marketplace: Marketplace) -> Result<ProxyLease, PoolExhausted> {
        self.acquire_at(marketplace, &[], Utc::now())
    }

    /// Like [`acquire`](Self::acquire) but never returns one of `exclude`.
    pub fn acquire_excluding(&self, marketplace: Marketplace, exclude: &[&str]) -> Result<ProxyLease, PoolExhausted> {
        self.acquire_at(marketplace, exclude, Utc::now())
    }

    /// Least-recently-used eligible proxy, then fewest consecutive failures, then
    /// residential before datacenter.
    pub fn acquire_at(
        &self,
        marketplace: Marketplace,
        exclude: &[&str],
        now: DateTime<Utc>,
    ) -> Result<ProxyLease, PoolExhausted> {
        let mut proxies = self.inner.lock();

        let selected = proxies
            .iter_mut()
            .filter(|p| p.is_eligible(now) && !exclude.contains(&p.endpoint.as_str()))
            .min_by_key(|p| (p.last_used_at, p.consecutive_failures, p.kind.preference_rank()))
            .ok_or(PoolExhausted)?;

        selected.in_use = true;
        selected.last_used_at = Some(now);
        tracing::debug!("Issued proxy {} for {}", selected.endpoint, marketplace);

        Ok(ProxyLease::new(&self.inner, selected))
    }

    /// Lease every proxy no job holds, cooling ones included. Round-robin order is left
    /// untouched.
    fn lease_idle(&self) -> Vec<ProxyLease> {
        let mut proxies = self.inner.lock();
        proxies
            .iter_mut()
            .filter(|p| !p.in_use)
            .map(|p| {
                p.in_use = true;
                ProxyLease::new(&self.inner, p)
            })
            .collect()
    }

    /// Check every idle proxy concurrently. A healthy answer clears its cooldown and
    /// failure streak; a failed one counts as a regular failure.
    pub async fn check_health(&self, check: &HealthCheck) -> HealthReport {
        let leases = self.lease_idle();
        let checks = leases.into_iter().map(|lease| async move {
            let result = ping_proxy(lease.endpoint(), check).await;
            (lease, result)
        });

        let mut report = HealthReport::default();
        for (lease, result) in join_all(checks).await {
            report.checked += 1;
            match result {
                Ok(elapsed) => {
                    report.healthy += 1;
                    lease.report_success(elapsed);
                }
                Err(reason) => {
                    tracing::debug!("Proxy {} failed health check: {}", lease.endpoint(), reason);
                    lease.report(false);
                }
            }
        }

        tracing::info!("Proxy health check complete: {}/{} healthy", report.healthy, report.checked);
        report
    }

    /// Return a leased proxy with its health outcome.
    pub fn report(&self, lease: ProxyLease, success: bool) {
        lease.report(success);
    }

    pub fn add_proxy(&self, endpoint: &str, kind: ProxyKind) -> bool {
        let mut proxies = self.inner.lock();
        if proxies.iter().any(|p| p.endpoint == endpoint) {
            return false;
        }
        proxies.push(ProxyRecord::new(endpoint, kind));
        tracing::info!("Added proxy {}", endpoint);
        true
    }

    pub fn remove_proxy(&self, endpoint: &str) -> bool {
        let mut proxies = self.inner.lock();
        let before = proxies.len();
        proxies.retain(|p| p.endpoint != endpoint);
        let removed = proxies.len() != before;
        if removed {
            tracing::info!("Removed proxy {}", endpoint);
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> PoolStats {
        let proxies = self.inner.lock();
        PoolStats {
            total: proxies.len(),
            available: proxies.iter().filter(|p| p.is_eligible(now)).count(),
            in_use: proxies.iter().filter(|p| p.in_use).count(),
            cooling_down: proxies.iter().filter(|p| p.is_cooling_down(now)).count(),
            total_successes: proxies.iter().map(|p| p.total_successes).sum(),
            total_failures: proxies.iter().map(|p| p.total_failures).sum(),
        }
    }

    pub fn records(&self) -> Vec<ProxyRecord> {
        self.inner.lock().clone()
    }
}

async fn ping_proxy(endpoint: &str, check: &HealthCheck) -> Result<StdDuration, String> {
    let proxy = Proxy::all(endpoint).map_err(|e| e.to_string())?;
    let client = Client::builder()
        .proxy(proxy)
        .timeout(check.timeout)
        .build()
        .map_err(|e| e.to_string())?;

    let started = Instant::now();
    let response = client
        .get(&check.url)
        .header(header::USER_AGENT, "price-sentinel-health/1.0")
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(started.elapsed())
    } else {
        Err(format!("HTTP {}", response.status().as_u16()))
    }
}

/// Exclusive use of one proxy for one attempt. Dropping an unreported lease returns the
/// proxy without touching its health.
pub struct ProxyLease {
    pool: Arc<PoolInner>,
    endpoint: String,
    kind: ProxyKind,
    settled: bool,
}

impl ProxyLease {
    fn new(pool: &Arc<PoolInner>, record: &ProxyRecord) -> Self {
        Self {
            pool: Arc::clone(pool),
            endpoint: record.endpoint.clone(),
            kind: record.kind,
            settled: false,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn report(self, success: bool) {
        self.report_at(success, Utc::now());
    }

    pub fn report_at(self, success: bool, now: DateTime<Utc>) {
        let outcome = if success { Settlement::Success(None) } else { Settlement::Failure };
        self.settle(outcome, now);
    }

    /// Success that also feeds the proxy's response-time average.
    pub fn report_success(self, response_time: StdDuration) {
        self.settle(Settlement::Success(Some(response_time)), Utc::now());
    }

    /// Hand the proxy back without judging it, e.g. when the page arrived but did not
    /// parse.
    pub fn release(self) {
        self.settle(Settlement::Neutral, Utc::now());
    }

    fn settle(mut self, outcome: Settlement, now: DateTime<Utc>) {
        self.pool.settle(&self.endpoint, outcome, now);
        self.settled = true;
    }
}

impl std::fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLease")
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.settle(&self.endpoint, Settlement::Neutral, Utc::now());
        }
    }
}

use metrics::counter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, info};

use crate::config::ScraperConfig;
use crate::fetcher::{FetchRequest, Fetcher, RawContent};
use crate::models::{AttemptOutcome, Product, ScrapeAttempt, ScrapedRecord};
use crate::plugins::ParserRegistry;
use crate::proxy_pool::ProxyPool;
use crate::utils::error::{ParseError, TerminalFailure};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub attempt_timeout: Duration,
    /// Parse failures tolerated before giving up; page content rarely changes between tries.
    pub max_parse_retries: u32,
    pub jitter: bool,
}

impl From<&ScraperConfig> for RetryPolicy {
    fn from(config: &ScraperConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            attempt_timeout: config.attempt_timeout(),
            max_parse_retries: config.max_parse_retries,
            jitter: true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ScraperConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The record is in hand.
    Done,
    /// Wait `delay`, then try again. `rotate_proxy` forbids the proxy just used.
    Retry { delay: Duration, rotate_proxy: bool },
    GiveUp,
}

/// Per-job retry bookkeeping: how many attempts ran, what the last one did and how
/// long to wait before the next. Holds no I/O, so policy is testable on its own.
pub struct RetryState {
    max_attempts: u32,
    max_parse_retries: u32,
    jitter: bool,
    attempts: u32,
    parse_failures: u32,
    last_outcome: Option<AttemptOutcome>,
    backoff: ExponentialBackoff,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        // Doubles from 2 x base: 2b, 4b, 8b, ... capped
        let base_ms = u64::try_from(policy.backoff_base.as_millis()).unwrap_or(u64::MAX).max(1);
        let backoff = ExponentialBackoff::from_millis(2)
            .factor(base_ms)
            .max_delay(policy.backoff_cap);

        Self {
            max_attempts: policy.max_attempts.max(1),
            max_parse_retries: policy.max_parse_retries,
            jitter: policy.jitter,
            attempts: 0,
            parse_failures: 0,
            last_outcome: None,
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_outcome(&self) -> Option<AttemptOutcome> {
        self.last_outcome
    }

    fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff.next().unwrap_or(Duration::ZERO);
        if self.jitter { jitter(delay) } else { delay }
    }

    /// Record the outcome of the attempt that just finished and decide what happens next.
    pub fn next(&mut self, outcome: AttemptOutcome) -> RetryDecision {
        self.attempts += 1;
        self.last_outcome = Some(outcome);

        if outcome == AttemptOutcome::Success {
            return RetryDecision::Done;
        }
        if self.attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        match outcome {
            AttemptOutcome::ParseError => {
                self.parse_failures += 1;
                if self.parse_failures > self.max_parse_retries {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry { delay: Duration::ZERO, rotate_proxy: false }
                }
            }
            AttemptOutcome::Blocked => RetryDecision::Retry { delay: Duration::ZERO, rotate_proxy: true },
            AttemptOutcome::Timeout | AttemptOutcome::NetworkError => RetryDecision::Retry {
                delay: self.next_backoff(),
                rotate_proxy: false,
            },
            AttemptOutcome::Success => RetryDecision::Done,
        }
    }
}

/// Everything one scrape job produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub attempts: Vec<ScrapeAttempt>,
    pub result: Result<ScrapedRecord, TerminalFailure>,
    /// Fetch latency of the successful attempt.
    pub response_time: Option<Duration>,
}

enum AttemptError {
    Fetch(AttemptOutcome, String),
    Parse(ParseError),
}

/// Fetch + parse wrapped in a bounded retry loop with proxy rotation.
pub struct RetryController {
    pool: ProxyPool,
    fetcher: Arc<dyn Fetcher>,
    parsers: Arc<ParserRegistry>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(pool: ProxyPool, fetcher: Arc<dyn Fetcher>, parsers: Arc<ParserRegistry>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            fetcher,
            parsers,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    async fn attempt(&self, product: &Product, request: &FetchRequest, proxy: &str) -> Result<(ScrapedRecord, RawContent), AttemptError> {
        let content = self
            .fetcher
            .fetch(request, proxy)
            .await
            .map_err(|e| AttemptError::Fetch(AttemptOutcome::from(&e), e.to_string()))?;
        let record = self
            .parsers
            .parse(product.marketplace, &content.body)
            .map_err(AttemptError::Parse)?;
        Ok((record, content))
    }

    /// Attempts are strictly sequential. Every per-attempt error is absorbed here; only
    /// the two `TerminalFailure` variants leave.
    pub async fn execute_with_retry(&self, product: &Product) -> JobOutcome {
        let request = FetchRequest::for_product(product, &self.parsers, self.policy.attempt_timeout);
        let mut state = RetryState::new(&self.policy);
        let mut attempts = Vec::new();
        let mut avoid: Option<String> = None;
        let mut last_error = String::new();

        loop {
            let exclude: Vec<&str> = avoid.as_deref().into_iter().collect();
            let lease = match self.pool.acquire_excluding(product.marketplace, &exclude) {
                Ok(lease) => lease,
                Err(exhausted) => {
                    info!(product_id = %product.id, marketplace = %product.marketplace, "{}; deferring job", exhausted);
                    return JobOutcome {
                        attempts,
                        result: Err(TerminalFailure::Capacity),
                        response_time: None,
                    };
                }
            };

            let proxy = lease.endpoint().to_string();
            let started = Instant::now();
            let result = self.attempt(product, &request, &proxy).await;

            let (outcome, error) = match &result {
                Ok(_) => (AttemptOutcome::Success, None),
                Err(AttemptError::Fetch(outcome, message)) => (*outcome, Some(message.clone())),
                Err(AttemptError::Parse(e)) => (AttemptOutcome::ParseError, Some(e.to_string())),
            };

            match &result {
                Ok((_, content)) => lease.report_success(content.elapsed),
                // The proxy delivered a page; what was on it says nothing about the proxy
                Err(AttemptError::Parse(_)) => lease.release(),
                Err(AttemptError::Fetch(..)) => lease.report(false),
            }

            counter!(
                "scrape_attempts_total",
                "marketplace" => product.marketplace.as_str(),
                "outcome" => outcome.as_str()
            )
            .increment(1);

            let attempt = ScrapeAttempt {
                product_id: product.id.clone(),
                proxy: proxy.clone(),
                attempt: state.attempts() + 1,
                outcome,
                elapsed: started.elapsed(),
                error: error.clone(),
            };
            debug!(
                product_id = %attempt.product_id,
                proxy = %attempt.proxy,
                attempt = attempt.attempt,
                outcome = outcome.as_str(),
                elapsed_ms = attempt.elapsed.as_millis() as u64,
                error = ?attempt.error,
                "Scrape attempt finished"
            );
            attempts.push(attempt);

            if let Some(message) = error {
                last_error = message;
            }

            match state.next(outcome) {
                RetryDecision::Done => {
                    if let Ok((record, content)) = result {
                        return JobOutcome {
                            attempts,
                            result: Ok(record),
                            response_time: Some(content.elapsed),
                        };
                    }
                }
                RetryDecision::Retry { delay, rotate_proxy } => {
                    avoid = rotate_proxy.then_some(proxy);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryDecision::GiveUp => {
                    return JobOutcome {
                        result: Err(TerminalFailure::Exhausted {
                            attempts: state.attempts(),
                            last_error,
                        }),
                        attempts,
                        response_time: None,
                    };
                }
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ProxyKind;

/// Pool member. Mutated only by the proxy pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyRecord {
    pub endpoint: String,
    pub kind: ProxyKind,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Leased to a job right now.
    pub in_use: bool,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Moving average of successful fetch latency.
    pub avg_response_ms: Option<f64>,
}

impl ProxyRecord {
    pub fn new(endpoint: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
            consecutive_failures: 0,
            cooldown_until: None,
            last_used_at: None,
            in_use: false,
            total_successes: 0,
            total_failures: 0,
            avg_response_ms: None,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// Fold one successful response time into the moving average; recent samples weigh 10%.
    pub fn record_response_time(&mut self, response_time: std::time::Duration) {
        let sample = response_time.as_secs_f64() * 1000.0;
        self.avg_response_ms = Some(match self.avg_response_ms {
            Some(avg) => avg * 0.9 + sample * 0.1,
            None => sample,
        });
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.in_use && !self.is_cooling_down(now)
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::error::{FetchError, ParseError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    ParseError,
    Blocked,
    NetworkError,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::ParseError => "parse_error",
            AttemptOutcome::Blocked => "blocked",
            AttemptOutcome::NetworkError => "network_error",
        }
    }
}

impl From<&FetchError> for AttemptOutcome {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::Timeout => AttemptOutcome::Timeout,
            FetchError::Network(_) => AttemptOutcome::NetworkError,
            FetchError::Blocked { .. } => AttemptOutcome::Blocked,
        }
    }
}

impl From<&ParseError> for AttemptOutcome {
    fn from(_: &ParseError) -> Self {
        AttemptOutcome::ParseError
    }
}

/// One fetch+parse try. In-memory only; discarded with the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeAttempt {
    pub product_id: String,
    pub proxy: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
    pub error: Option<String>,
}

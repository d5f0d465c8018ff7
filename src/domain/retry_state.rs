//! 재시도 상태 머신 - entity retry/backoff transitions
//!
//! PENDING → QUEUED → FETCHING → {SUCCESS | FAILED | TIMEOUT | BLOCKED}, with
//! every non in-flight status looping back to QUEUED when re-selected. The only
//! dormant state is "retries exhausted", marked by a null `next_due`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::ScrapingStatus;

/// 1 hour base delay
pub const BACKOFF_BASE_SECS: i64 = 3_600;
/// 7 day cap
pub const BACKOFF_CAP_SECS: i64 = 604_800;

/// `min(3600 * 2^(attempts-1), 604800)` seconds
///
/// `attempts` is the counter after the failed attempt was added, so the first
/// failure waits one hour.
#[must_use]
pub fn backoff_seconds(attempts: u32) -> i64 {
    // 2^20 hours is far past the cap; keeps the shift in range
    let exponent = attempts.saturating_sub(1).min(20);
    (BACKOFF_BASE_SECS << exponent).min(BACKOFF_CAP_SECS)
}

#[must_use]
pub fn backoff(attempts: u32) -> Duration {
    Duration::seconds(backoff_seconds(attempts))
}

/// Why a scrape attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Response arrived with status >= 400
    HttpStatus(u16),
    /// Connect or network-level failure
    Network(String),
    /// Anything else, including collaborator failures after a good fetch
    Unexpected(String),
}

impl FailureKind {
    /// 403/429 → BLOCKED, other HTTP errors → FAILED, network → TIMEOUT
    #[must_use]
    pub const fn status(&self) -> ScrapingStatus {
        match self {
            Self::HttpStatus(403 | 429) => ScrapingStatus::Blocked,
            Self::HttpStatus(_) | Self::Unexpected(_) => ScrapingStatus::Failed,
            Self::Network(_) => ScrapingStatus::Timeout,
        }
    }

    #[must_use]
    pub const fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus(code) => Some(*code),
            _ => None,
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::HttpStatus(code) => format!("HTTP status {code}"),
            Self::Network(msg) => format!("Network failure: {msg}"),
            Self::Unexpected(msg) => msg.clone(),
        }
    }
}

/// Entity state after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureTransition {
    pub status: ScrapingStatus,
    pub attempts: u32,
    /// None once attempts reach the limit
    pub next_due: Option<DateTime<Utc>>,
}

impl FailureTransition {
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.next_due.is_none()
    }
}

/// Retry limits for the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Applies one failed attempt on top of `previous_attempts`
    #[must_use]
    pub fn on_failure(
        &self,
        previous_attempts: u32,
        kind: &FailureKind,
        now: DateTime<Utc>,
    ) -> FailureTransition {
        let attempts = previous_attempts.saturating_add(1);
        let next_due = if attempts >= self.max_attempts {
            None
        } else {
            Some(now + backoff(attempts))
        };

        FailureTransition {
            status: kind.status(),
            attempts,
            next_due,
        }
    }

    /// Whether an entity with this many attempts may still be retried
    #[must_use]
    pub const fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

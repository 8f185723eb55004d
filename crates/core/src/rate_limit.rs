//! Cooldown/backoff gating.
//!
//! The limiter is a pure function of a stored record and the current time. All
//! of its state lives in `next_allowed_run` (and `consecutive_failures` for the
//! exponential strategy), so every invocation reaches the same decision.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::record::JobRecord;

/// How the post-failure window grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same backoff after every failure.
    #[default]
    Fixed,
    /// base * 2^(failures - 1), capped below the cooldown.
    Exponential,
}

/// Outcome of evaluating the gate for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    /// Still inside the post-success cooldown.
    CoolingDown { until: i64 },
    /// Still inside the post-failure backoff.
    BackingOff { until: i64 },
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Gate::Open)
    }
}

/// Cooldown/backoff policy.
///
/// Deserialization goes through [`RateLimiter::new`], so a stored policy can
/// never carry a backoff window as long as its cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RateLimiterFields")]
pub struct RateLimiter {
    cooldown_secs: u64,
    backoff_secs: u64,
    strategy: BackoffStrategy,
}

#[derive(Deserialize)]
struct RateLimiterFields {
    cooldown_secs: u64,
    backoff_secs: u64,
    #[serde(default)]
    strategy: BackoffStrategy,
}

impl TryFrom<RateLimiterFields> for RateLimiter {
    type Error = DomainError;

    fn try_from(fields: RateLimiterFields) -> Result<Self, Self::Error> {
        Self::new(fields.cooldown_secs, fields.backoff_secs, fields.strategy)
    }
}

impl RateLimiter {
    /// Build a limiter; `backoff_secs` must be strictly shorter than `cooldown_secs`.
    pub fn new(cooldown_secs: u64, backoff_secs: u64, strategy: BackoffStrategy) -> DomainResult<Self> {
        if backoff_secs >= cooldown_secs {
            return Err(DomainError::validation(format!(
                "backoff ({backoff_secs}s) must be shorter than cooldown ({cooldown_secs}s)"
            )));
        }
        Ok(Self {
            cooldown_secs,
            backoff_secs,
            strategy,
        })
    }

    pub fn fixed(cooldown_secs: u64, backoff_secs: u64) -> DomainResult<Self> {
        Self::new(cooldown_secs, backoff_secs, BackoffStrategy::Fixed)
    }

    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_secs
    }

    pub fn backoff_secs(&self) -> u64 {
        self.backoff_secs
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    /// Evaluate the gate. `now >= next_allowed_run` is eligible.
    pub fn gate(&self, record: &JobRecord, now: i64) -> Gate {
        if now >= record.next_allowed_run {
            return Gate::Open;
        }
        let until = record.next_allowed_run;
        if record.consecutive_failures > 0 {
            Gate::BackingOff { until }
        } else {
            Gate::CoolingDown { until }
        }
    }

    pub fn next_after_success(&self, now: i64) -> i64 {
        now.saturating_add(secs(self.cooldown_secs))
    }

    /// Backoff window for the given number of consecutive failures (1-indexed).
    pub fn backoff_for(&self, consecutive_failures: u32) -> u64 {
        match self.strategy {
            BackoffStrategy::Fixed => self.backoff_secs,
            BackoffStrategy::Exponential => {
                let shift = consecutive_failures.saturating_sub(1).min(32);
                let grown = self.backoff_secs.saturating_mul(1u64 << shift);
                grown.min(self.cooldown_secs.saturating_sub(1))
            }
        }
    }

    pub fn next_after_failure(&self, now: i64, consecutive_failures: u32) -> i64 {
        now.saturating_add(secs(self.backoff_for(consecutive_failures)))
    }
}

fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

//! Core job-execution types: the job body seam and invocation outcomes.

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobgate_core::{JobIdentity, RunId};

/// Failure reported by a job body.
///
/// Opaque to the coordinator: only the message is persisted (truncated) and
/// forwarded to the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// The opaque, possibly side-effecting unit of work guarded by the coordinator.
///
/// Invoked at most once per acquired lease. `Ok(Some(reference))` records an
/// output location (e.g. an object key) on the job record.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn execute(&self) -> Result<Option<String>, JobError>;
}

/// Adapter turning an async closure into a [`JobBody`].
pub struct FnJob<F> {
    f: F,
}

impl<F, Fut> FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, JobError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobBody for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, JobError>> + Send + 'static,
{
    async fn execute(&self) -> Result<Option<String>, JobError> {
        (self.f)().await
    }
}

/// Why an invocation exited without running the job body.
///
/// None of these are errors: the trigger supplies the retry cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Another execution holds the lock.
    AlreadyRunning { since: Option<i64> },
    /// Post-success cooldown has not elapsed.
    CoolingDown { until: i64 },
    /// Post-failure backoff has not elapsed.
    BackingOff { until: i64 },
    /// Non-recurring record already completed successfully.
    AlreadyCompleted { completed_at: Option<i64> },
    /// A concurrent caller won the conditional write.
    RaceLost,
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SkipReason::AlreadyRunning { .. } => f.write_str("job already running"),
            SkipReason::CoolingDown { until } => write!(f, "cooldown active until {until}"),
            SkipReason::BackingOff { until } => write!(f, "failure backoff active until {until}"),
            SkipReason::AlreadyCompleted { .. } => f.write_str("job already completed"),
            SkipReason::RaceLost => f.write_str("lock acquired by a concurrent invocation"),
        }
    }
}

/// Terminal result handed to [`Lease::release`](super::lock::Lease::release).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success { result_ref: Option<String> },
    Failure { error: String },
}

/// Result of one coordinator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    /// The body ran and its success was persisted.
    Succeeded {
        identity: JobIdentity,
        run_id: RunId,
        result_ref: Option<String>,
        version: u64,
        run_count: u64,
    },
    /// The body ran and failed. `persisted` is `false` when recording the
    /// failure itself failed (logged separately).
    Failed {
        identity: JobIdentity,
        run_id: RunId,
        error: String,
        persisted: bool,
    },
    /// The body did not run.
    Skipped {
        identity: JobIdentity,
        reason: SkipReason,
    },
}

impl ExecutionOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ExecutionOutcome::Skipped { .. })
    }

    /// Whether this invocation actually executed the job body.
    pub fn executed(&self) -> bool {
        !self.is_skipped()
    }
}

//! Single-writer lock over a job record, built from conditional writes.
//!
//! ## Protocol
//!
//! - `try_acquire` reads the record once, applies the running/idempotency/rate
//!   gates without writing, then attempts exactly one guarded write
//!   (`status == read status AND version == read version`). A lost race is a
//!   skip, never a retry loop: the external trigger supplies the cadence.
//! - The returned [`Lease`] carries the new version as its token. Its release
//!   is fenced on that token, so a late or duplicate release can never clobber
//!   newer state. A rejected release means exclusivity was broken and is
//!   surfaced as [`LockError::ConsistencyViolation`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use jobgate_core::{
    Clock, Gate, JobIdentity, JobRecord, JobStatus, KeySchema, Precondition, RateLimiter,
    RecordKey, RecordUpdate, RunId, truncate_error,
};

use crate::config::AcquireMode;
use crate::notify::NotificationSink;
use crate::state_store::{StateStore, StateStoreError};

use super::types::{ReleaseOutcome, SkipReason};

/// Message recorded when a lease is dropped without an explicit release.
pub const ABORTED_RELEASE_MESSAGE: &str = "execution aborted before the lease was released";

/// Lock manager error.
#[derive(Debug, Error)]
pub enum LockError {
    /// Pre-existing mode and the record was never seeded.
    #[error("job record {0} does not exist (seed it before triggering runs)")]
    RecordMissing(RecordKey),

    /// The version-fenced release was rejected.
    #[error("consistency violation on {key}: release with lease token {token} rejected ({detail})")]
    ConsistencyViolation {
        key: RecordKey,
        token: u64,
        detail: String,
    },

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// Lock behaviour knobs (derived from `CoordinatorConfig`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    pub acquire_mode: AcquireMode,
    pub key_schema: KeySchema,
    /// Recurring jobs return to `IDLE` after each run; otherwise the record
    /// keeps its terminal `SUCCESS`/`FAILED` status.
    pub recurring: bool,
    /// Optional forced takeover of `RUNNING` records older than this.
    pub stale_lock_timeout_secs: Option<u64>,
    pub max_error_len: usize,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            acquire_mode: AcquireMode::PreExisting,
            key_schema: KeySchema::SingleJob,
            recurring: true,
            stale_lock_timeout_secs: None,
            max_error_len: jobgate_core::MAX_ERROR_LEN,
        }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug)]
pub enum Acquisition {
    Acquired(Lease),
    Rejected(SkipReason),
}

struct LockContext {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    policy: LockPolicy,
    /// Told about leases released from the drop guard.
    abort_notifier: Option<Arc<dyn NotificationSink>>,
}

/// Acquires and releases the single-writer lock of job records.
pub struct LockManager {
    ctx: Arc<LockContext>,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        limiter: RateLimiter,
        policy: LockPolicy,
    ) -> Self {
        Self {
            ctx: Arc::new(LockContext {
                store,
                clock,
                limiter,
                policy,
                abort_notifier: None,
            }),
        }
    }

    /// Notify `notifier` whenever a dropped lease is released as a failure.
    pub fn notify_aborts(self, notifier: Arc<dyn NotificationSink>) -> Self {
        let ctx = &self.ctx;
        Self {
            ctx: Arc::new(LockContext {
                store: ctx.store.clone(),
                clock: ctx.clock.clone(),
                limiter: ctx.limiter,
                policy: ctx.policy.clone(),
                abort_notifier: Some(notifier),
            }),
        }
    }

    pub fn key_for(&self, identity: &JobIdentity) -> RecordKey {
        RecordKey::new(identity.clone(), self.ctx.policy.key_schema)
    }

    /// Out-of-band creation of an eligible `IDLE` record.
    pub async fn seed(&self, identity: &JobIdentity) -> Result<JobRecord, StateStoreError> {
        let record = self
            .ctx
            .store
            .create(JobRecord::idle(self.key_for(identity)))
            .await?;
        info!(key = %record.key, "job record seeded");
        Ok(record)
    }

    /// Strongly consistent read of the current record.
    pub async fn inspect(&self, identity: &JobIdentity) -> Result<Option<JobRecord>, StateStoreError> {
        self.ctx.store.get(&self.key_for(identity)).await
    }

    /// Attempt to take the lock once.
    pub async fn try_acquire(&self, identity: &JobIdentity) -> Result<Acquisition, LockError> {
        let ctx = &self.ctx;
        let key = self.key_for(identity);
        let now = ctx.clock.now();

        let Some(record) = ctx.store.get(&key).await? else {
            return self.acquire_absent(key, now).await;
        };

        debug!(
            key = %key,
            status = %record.status,
            version = record.version,
            next_allowed_run = record.next_allowed_run,
            "state check"
        );

        let mut takeover = false;
        if record.status.is_running() {
            let violation = record.check_running_invariant(now).err();
            if let Some(violation) = &violation {
                error!(key = %key, error = %violation, "running record is inconsistent");
            }
            if self.is_stale(&record, now, violation.is_some()) {
                takeover = true;
            } else {
                info!(key = %key, since = ?record.last_run_ts, "job already running");
                return Ok(Acquisition::Rejected(SkipReason::AlreadyRunning {
                    since: record.last_run_ts,
                }));
            }
        }

        if !takeover {
            if !ctx.policy.recurring && record.status == JobStatus::Success {
                info!(key = %key, "job already completed");
                return Ok(Acquisition::Rejected(SkipReason::AlreadyCompleted {
                    completed_at: record.completed_at,
                }));
            }

            match ctx.limiter.gate(&record, now) {
                Gate::Open => {}
                Gate::CoolingDown { until } => {
                    info!(key = %key, until, "rate limited (cooldown)");
                    return Ok(Acquisition::Rejected(SkipReason::CoolingDown { until }));
                }
                Gate::BackingOff { until } => {
                    info!(key = %key, until, "rate limited (failure backoff)");
                    return Ok(Acquisition::Rejected(SkipReason::BackingOff { until }));
                }
            }
        }

        let run_id = RunId::new();
        let precondition = Precondition::status_and_version(record.status, record.version);
        match ctx
            .store
            .update(&key, precondition, &RecordUpdate::acquire(now, run_id))
            .await
        {
            Ok(updated) => {
                if takeover {
                    warn!(
                        key = %key,
                        %run_id,
                        stale_since = ?record.last_run_ts,
                        version = updated.version,
                        "stale lock taken over"
                    );
                } else {
                    info!(key = %key, %run_id, version = updated.version, "lock acquired");
                }
                Ok(Acquisition::Acquired(Lease::new(
                    self.ctx.clone(),
                    &updated,
                    run_id,
                )))
            }
            Err(StateStoreError::PreconditionFailed { .. }) => {
                info!(key = %key, version = record.version, "lock race lost");
                Ok(Acquisition::Rejected(SkipReason::RaceLost))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn acquire_absent(&self, key: RecordKey, now: i64) -> Result<Acquisition, LockError> {
        match self.ctx.policy.acquire_mode {
            AcquireMode::PreExisting => {
                error!(key = %key, "job record missing");
                Err(LockError::RecordMissing(key))
            }
            AcquireMode::CreateIfAbsent => {
                let run_id = RunId::new();
                match self
                    .ctx
                    .store
                    .create(JobRecord::running(key.clone(), now, run_id))
                    .await
                {
                    Ok(created) => {
                        info!(key = %key, %run_id, version = created.version, "lock acquired (record created)");
                        Ok(Acquisition::Acquired(Lease::new(
                            self.ctx.clone(),
                            &created,
                            run_id,
                        )))
                    }
                    Err(StateStoreError::AlreadyExists(_)) => {
                        info!(key = %key, "record created concurrently; lock held elsewhere");
                        Ok(Acquisition::Rejected(SkipReason::RaceLost))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Only ever `true` with takeover enabled. An inconsistent running record
    /// is stale regardless of its age.
    fn is_stale(&self, record: &JobRecord, now: i64, inconsistent: bool) -> bool {
        let Some(timeout) = self.ctx.policy.stale_lock_timeout_secs else {
            return false;
        };
        if inconsistent {
            return true;
        }
        let timeout = i64::try_from(timeout).unwrap_or(i64::MAX);
        record
            .last_run_ts
            .is_some_and(|started| now.saturating_sub(started) > timeout)
    }
}

struct LeaseState {
    key: RecordKey,
    token: u64,
    run_id: RunId,
    prior_failures: u32,
}

/// Proof of lock ownership for one acquisition.
///
/// Consumed by [`Lease::release`], so a lease is released at most once. A
/// lease dropped unreleased (panicking job body, cancelled invocation)
/// schedules a failure release, followed by the abort notification, on the
/// current tokio runtime. If that runtime shuts down first (a panic unwinding
/// `main`), neither happens and the record stays `RUNNING` until a stale
/// takeover.
#[must_use = "an unreleased lease leaves the job record RUNNING"]
pub struct Lease {
    ctx: Arc<LockContext>,
    state: Option<LeaseState>,
}

impl core::fmt::Debug for Lease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct("Lease");
        if let Some(state) = &self.state {
            s.field("key", &state.key)
                .field("token", &state.token)
                .field("run_id", &state.run_id);
        }
        s.finish_non_exhaustive()
    }
}

impl Lease {
    fn new(ctx: Arc<LockContext>, record: &JobRecord, run_id: RunId) -> Self {
        Self {
            ctx,
            state: Some(LeaseState {
                key: record.key.clone(),
                token: record.version,
                run_id,
                prior_failures: record.consecutive_failures,
            }),
        }
    }

    /// Version this lease fences its release on.
    pub fn token(&self) -> u64 {
        self.state.as_ref().map(|s| s.token).unwrap_or_default()
    }

    pub fn run_id(&self) -> RunId {
        self.state.as_ref().map(|s| s.run_id).unwrap_or_default()
    }

    /// Record the terminal outcome and give up the lock.
    pub async fn release(mut self, outcome: ReleaseOutcome) -> Result<JobRecord, LockError> {
        match self.state.take() {
            Some(state) => release_with(&self.ctx, state, outcome).await,
            None => unreachable!("lease state is only taken by release or drop"),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };

        warn!(
            key = %state.key,
            run_id = %state.run_id,
            token = state.token,
            "lease dropped without release; scheduling failure release"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ctx = self.ctx.clone();
                handle.spawn(async move {
                    let key = state.key.clone();
                    let outcome = ReleaseOutcome::Failure {
                        error: ABORTED_RELEASE_MESSAGE.to_string(),
                    };
                    if let Err(e) = release_with(&ctx, state, outcome).await {
                        error!(key = %key, error = %e, "deferred release failed");
                    }
                    if let Some(notifier) = &ctx.abort_notifier {
                        if let Err(e) = notifier.notify(&key.partition, ABORTED_RELEASE_MESSAGE).await {
                            warn!(key = %key, error = %e, "failure notification not delivered");
                        }
                    }
                });
            }
            Err(_) => {
                error!(
                    key = %state.key,
                    run_id = %state.run_id,
                    "no async runtime to release dropped lease; record stays RUNNING"
                );
            }
        }
    }
}

async fn release_with(
    ctx: &LockContext,
    state: LeaseState,
    outcome: ReleaseOutcome,
) -> Result<JobRecord, LockError> {
    let now = ctx.clock.now();
    let recurring = ctx.policy.recurring;

    let update = match &outcome {
        ReleaseOutcome::Success { result_ref } => RecordUpdate {
            status: Some(if recurring { JobStatus::Idle } else { JobStatus::Success }),
            last_success_ts: Some(now),
            completed_at: Some(now),
            next_allowed_run: Some(ctx.limiter.next_after_success(now)),
            increment_run_count: true,
            consecutive_failures: Some(0),
            result_ref: result_ref.clone(),
            ..RecordUpdate::default()
        },
        ReleaseOutcome::Failure { error } => {
            let failures = state.prior_failures.saturating_add(1);
            RecordUpdate {
                status: Some(if recurring { JobStatus::Idle } else { JobStatus::Failed }),
                completed_at: Some(now),
                next_allowed_run: Some(ctx.limiter.next_after_failure(now, failures)),
                consecutive_failures: Some(failures),
                last_error: Some(truncate_error(error, ctx.policy.max_error_len)),
                ..RecordUpdate::default()
            }
        }
    };

    match ctx
        .store
        .update(&state.key, Precondition::version(state.token), &update)
        .await
    {
        Ok(record) => {
            info!(
                key = %state.key,
                run_id = %state.run_id,
                status = %record.status,
                version = record.version,
                next_allowed_run = record.next_allowed_run,
                "lock released"
            );
            Ok(record)
        }
        Err(e @ (StateStoreError::PreconditionFailed { .. } | StateStoreError::NotFound(_))) => {
            error!(
                key = %state.key,
                run_id = %state.run_id,
                token = state.token,
                error = %e,
                "release rejected: exclusivity invariant violated"
            );
            Err(LockError::ConsistencyViolation {
                key: state.key,
                token: state.token,
                detail: e.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

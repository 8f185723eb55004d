//! Persisted job-state record and the mutations the coordinator applies to it.
//!
//! A [`JobRecord`] is the only coordination state of a logical job. Stores apply
//! a [`RecordUpdate`] only when a [`Precondition`] holds against the current
//! record, and every accepted update bumps `version` by exactly one.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobIdentity, RecordKey, RunId};

/// Upper bound (in characters) for a persisted `last_error`.
pub const MAX_ERROR_LEN: usize = 500;

/// Execution status of a job record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Eligible to run (subject to the rate gate).
    Idle,
    /// An execution holds the lock.
    Running,
    /// Last execution completed successfully.
    Success,
    /// Last execution failed.
    Failed,
}

impl JobStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "IDLE",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = crate::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(JobStatus::Idle),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(crate::DomainError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Lifecycle record of one logical job.
///
/// Timestamps are seconds since the Unix epoch and are only ever set by the
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: RecordKey,
    pub status: JobStatus,
    /// Optimistic-concurrency fence; +1 on every accepted write.
    pub version: u64,
    pub last_run_ts: Option<i64>,
    pub last_run_id: Option<RunId>,
    pub last_success_ts: Option<i64>,
    pub completed_at: Option<i64>,
    /// Acquisition attempts before this instant are rejected.
    pub next_allowed_run: i64,
    /// Successful executions only.
    pub run_count: u64,
    /// Failures since the last success (drives exponential backoff).
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
}

impl JobRecord {
    /// A fresh, immediately eligible record (out-of-band seeding).
    pub fn idle(key: RecordKey) -> Self {
        Self {
            key,
            status: JobStatus::Idle,
            version: 0,
            last_run_ts: None,
            last_run_id: None,
            last_success_ts: None,
            completed_at: None,
            next_allowed_run: 0,
            run_count: 0,
            consecutive_failures: 0,
            last_error: None,
            result_ref: None,
        }
    }

    /// A record created directly in `Running` (create-if-absent acquisition).
    ///
    /// Starts at version 1, as if an idle seed had been acquired.
    pub fn running(key: RecordKey, now: i64, run_id: RunId) -> Self {
        Self {
            status: JobStatus::Running,
            version: 1,
            last_run_ts: Some(now),
            last_run_id: Some(run_id),
            ..Self::idle(key)
        }
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.key.partition
    }

    /// Check the running-record invariant: a `RUNNING` record has a
    /// `last_run_ts` not in the future and no completion newer than it.
    pub fn check_running_invariant(&self, now: i64) -> DomainResult<()> {
        if !self.status.is_running() {
            return Ok(());
        }
        match self.last_run_ts {
            None => Err(DomainError::invariant(format!(
                "{} is RUNNING without last_run_ts",
                self.key
            ))),
            Some(started) if started > now => Err(DomainError::invariant(format!(
                "{} started at {started}, after now ({now})",
                self.key
            ))),
            Some(started) => match self.completed_at {
                Some(done) if done > started => Err(DomainError::invariant(format!(
                    "{} completed at {done}, after its running start ({started})",
                    self.key
                ))),
                _ => Ok(()),
            },
        }
    }
}

/// Guard evaluated atomically by the store before applying an update.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precondition {
    /// Version the caller read (or its lease token).
    pub version: u64,
    /// Status the caller read, when the write is also status-guarded.
    pub status: Option<JobStatus>,
}

impl Precondition {
    pub fn version(version: u64) -> Self {
        Self {
            version,
            status: None,
        }
    }

    pub fn status_and_version(status: JobStatus, version: u64) -> Self {
        Self {
            version,
            status: Some(status),
        }
    }

    pub fn holds(&self, record: &JobRecord) -> bool {
        record.version == self.version && self.status.is_none_or(|s| s == record.status)
    }
}

/// Field-level mutation of a [`JobRecord`].
///
/// `None` fields are left untouched. `version` is never part of the update:
/// stores always advance it by one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub status: Option<JobStatus>,
    pub last_run_ts: Option<i64>,
    pub last_run_id: Option<RunId>,
    pub last_success_ts: Option<i64>,
    pub completed_at: Option<i64>,
    pub next_allowed_run: Option<i64>,
    /// Atomic `run_count = run_count + 1`.
    pub increment_run_count: bool,
    pub consecutive_failures: Option<u32>,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
}

impl RecordUpdate {
    /// Lock acquisition: `status = RUNNING, last_run_ts = now`.
    pub fn acquire(now: i64, run_id: RunId) -> Self {
        Self {
            status: Some(JobStatus::Running),
            last_run_ts: Some(now),
            last_run_id: Some(run_id),
            ..Self::default()
        }
    }

    /// Produce the record as it looks after this update was accepted.
    pub fn apply(&self, record: &JobRecord) -> JobRecord {
        let mut next = record.clone();
        next.version = record.version + 1;
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(ts) = self.last_run_ts {
            next.last_run_ts = Some(ts);
        }
        if let Some(run_id) = self.last_run_id {
            next.last_run_id = Some(run_id);
        }
        if let Some(ts) = self.last_success_ts {
            next.last_success_ts = Some(ts);
        }
        if let Some(ts) = self.completed_at {
            next.completed_at = Some(ts);
        }
        if let Some(ts) = self.next_allowed_run {
            next.next_allowed_run = ts;
        }
        if self.increment_run_count {
            next.run_count += 1;
        }
        if let Some(n) = self.consecutive_failures {
            next.consecutive_failures = n;
        }
        if let Some(err) = &self.last_error {
            next.last_error = Some(err.clone());
        }
        if let Some(result_ref) = &self.result_ref {
            next.result_ref = Some(result_ref.clone());
        }
        next
    }
}

/// Truncate an error message to at most `max_chars` characters.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::KeySchema;

    fn key() -> RecordKey {
        RecordKey::new(JobIdentity::new("job-x").unwrap(), KeySchema::SingleJob)
    }

    #[test]
    fn apply_bumps_version_and_touches_only_set_fields() {
        let record = JobRecord::idle(key());
        let run_id = RunId::new();
        let next = RecordUpdate::acquire(100, run_id).apply(&record);

        assert_eq!(next.version, 1);
        assert_eq!(next.status, JobStatus::Running);
        assert_eq!(next.last_run_ts, Some(100));
        assert_eq!(next.last_run_id, Some(run_id));
        assert_eq!(next.next_allowed_run, 0);
        assert_eq!(next.run_count, 0);
        assert!(next.last_error.is_none());
    }

    #[test]
    fn run_count_increments_atomically_with_update() {
        let record = JobRecord::idle(key());
        let update = RecordUpdate {
            status: Some(JobStatus::Idle),
            increment_run_count: true,
            ..Default::default()
        };
        let once = update.apply(&record);
        let twice = update.apply(&once);
        assert_eq!(twice.run_count, 2);
        assert_eq!(twice.version, 2);
    }

    #[test]
    fn precondition_checks_version_and_optional_status() {
        let mut record = JobRecord::idle(key());
        record.version = 5;

        assert!(Precondition::version(5).holds(&record));
        assert!(!Precondition::version(4).holds(&record));
        assert!(Precondition::status_and_version(JobStatus::Idle, 5).holds(&record));
        assert!(!Precondition::status_and_version(JobStatus::Running, 5).holds(&record));
    }

    #[test]
    fn running_record_starts_at_version_one() {
        let record = JobRecord::running(key(), 42, RunId::new());
        assert_eq!(record.version, 1);
        assert!(record.status.is_running());
        assert!(record.check_running_invariant(42).is_ok());
        assert!(matches!(
            record.check_running_invariant(41),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn running_record_without_start_or_with_newer_completion_is_invalid() {
        let mut record = JobRecord::running(key(), 42, RunId::new());
        record.completed_at = Some(50);
        assert!(record.check_running_invariant(60).is_err());

        record.completed_at = Some(40);
        assert!(record.check_running_invariant(60).is_ok());

        record.last_run_ts = None;
        assert!(record.check_running_invariant(60).is_err());

        assert!(JobRecord::idle(key()).check_running_invariant(0).is_ok());
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        assert_eq!(truncate_error("short", 500), "short");

        let long = "x".repeat(800);
        assert_eq!(truncate_error(&long, MAX_ERROR_LEN).chars().count(), 500);

        let multibyte = "é".repeat(600);
        let truncated = truncate_error(&multibyte, MAX_ERROR_LEN);
        assert_eq!(truncated.chars().count(), 500);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Idle,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<JobStatus>().is_err());
    }
}

//! Identifiers and key schema for job-state records.

use core::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Date format of per-execution keys (`YYYY-MM-DD`).
pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// Sort key used by the single-job key schema.
pub const SINGLE_JOB_SORT_KEY: &str = "STATE";

/// Logical identity of a job record (the partition key).
///
/// Either a fixed job id (`nightly-report`) or a per-execution key such as a
/// calendar date (`2025-06-01`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobIdentity(String);

impl JobIdentity {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("job identity must not be empty"));
        }
        if trimmed.len() != value.len() {
            return Err(DomainError::invalid_id(format!(
                "job identity must not have surrounding whitespace: {value:?}"
            )));
        }
        Ok(Self(value))
    }

    /// Identity for a date-keyed execution.
    pub fn for_date(date: NaiveDate) -> Self {
        Self(date.format(DATE_KEY_FORMAT).to_string())
    }

    /// Parse a `YYYY-MM-DD` execution key.
    pub fn parse_date_key(value: &str) -> Result<Self, DomainError> {
        let date = NaiveDate::parse_from_str(value, DATE_KEY_FORMAT).map_err(|e| {
            DomainError::invalid_id(format!("expected date key YYYY-MM-DD, got {value:?}: {e}"))
        })?;
        Ok(Self::for_date(date))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobIdentity {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobIdentity {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobIdentity> for String {
    fn from(value: JobIdentity) -> Self {
        value.0
    }
}

/// Identifier of one acquisition (one invocation that won the lock).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Uses UUIDv7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RunId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// How identities map onto the store's composite key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySchema {
    /// One record per job id, under the fixed sort key `STATE`.
    #[default]
    SingleJob,
    /// Identity is the whole key (per-date execution records).
    PartitionOnly,
}

/// Composite store key of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub partition: JobIdentity,
    pub sort: String,
}

impl RecordKey {
    pub fn new(identity: JobIdentity, schema: KeySchema) -> Self {
        let sort = match schema {
            KeySchema::SingleJob => SINGLE_JOB_SORT_KEY.to_string(),
            KeySchema::PartitionOnly => String::new(),
        };
        Self {
            partition: identity,
            sort,
        }
    }
}

impl core::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.sort.is_empty() {
            write!(f, "{}", self.partition)
        } else {
            write!(f, "{}#{}", self.partition, self.sort)
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use jobgate_core::{JobRecord, Precondition, RecordKey, RecordUpdate};

/// State store operation error.
///
/// `AlreadyExists` and `PreconditionFailed` are the two *conditional* outcomes
/// callers branch on; everything else is an infrastructure failure that is
/// surfaced as-is.
#[derive(Debug, Clone, Error)]
pub enum StateStoreError {
    #[error("record not found: {0}")]
    NotFound(RecordKey),

    #[error("record already exists: {0}")]
    AlreadyExists(RecordKey),

    #[error("precondition failed for {key}: expected {expected:?}")]
    PreconditionFailed {
        key: RecordKey,
        expected: Precondition,
    },

    /// Network, pool or timeout failures.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the operation for another reason.
    #[error("state store backend error: {0}")]
    Backend(String),

    /// A stored row could not be decoded into a `JobRecord`.
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

/// Single-key, strongly consistent store with conditional writes.
///
/// ## Implementation Requirements
///
/// - `get` must be strongly consistent (read-your-writes across processes).
/// - `create` is "create if absent": an existing key yields `AlreadyExists`
///   and the stored record is left untouched.
/// - `update` evaluates `precondition` and applies `update` atomically; on
///   success the stored `version` becomes `version + 1`, and `run_count`
///   increments are applied store-side. A rejected update leaves the record
///   unchanged and yields `PreconditionFailed` (or `NotFound`).
/// - No multi-key transactions are required or used.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<JobRecord>, StateStoreError>;

    async fn create(&self, record: JobRecord) -> Result<JobRecord, StateStoreError>;

    async fn update(
        &self,
        key: &RecordKey,
        precondition: Precondition,
        update: &RecordUpdate,
    ) -> Result<JobRecord, StateStoreError>;
}

#[async_trait]
impl<S> StateStore for Arc<S>
where
    S: StateStore + ?Sized,
{
    async fn get(&self, key: &RecordKey) -> Result<Option<JobRecord>, StateStoreError> {
        (**self).get(key).await
    }

    async fn create(&self, record: JobRecord) -> Result<JobRecord, StateStoreError> {
        (**self).create(record).await
    }

    async fn update(
        &self,
        key: &RecordKey,
        precondition: Precondition,
        update: &RecordUpdate,
    ) -> Result<JobRecord, StateStoreError> {
        (**self).update(key, precondition, update).await
    }
}

//! `jobgate-core`: job-state model building blocks.
//!
//! This crate contains **pure** primitives (no store or transport concerns):
//! the persisted record, its conditional-write vocabulary and the rate gate.

pub mod clock;
pub mod error;
pub mod id;
pub mod rate_limit;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobIdentity, KeySchema, RecordKey, RunId};
pub use rate_limit::{BackoffStrategy, Gate, RateLimiter};
pub use record::{
    JobRecord, JobStatus, MAX_ERROR_LEN, Precondition, RecordUpdate, truncate_error,
};

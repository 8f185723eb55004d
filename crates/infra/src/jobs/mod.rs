//! Single-execution job coordination over a conditional-write store.
//!
//! ## Components
//!
//! - `JobBody`: the opaque unit of work (async trait, `FnJob` for closures)
//! - `LockManager` / `Lease`: version-fenced single-writer lock on a job record
//! - `ExecutionCoordinator`: gate, acquire, execute once, release, notify
//! - `ExecutionOutcome`: what one invocation did (succeeded, failed, skipped)

pub mod coordinator;
pub mod lock;
pub mod types;

pub use coordinator::{CoordinatorError, ExecutionCoordinator, ExecutionCoordinatorBuilder};
pub use lock::{ABORTED_RELEASE_MESSAGE, Acquisition, Lease, LockError, LockManager, LockPolicy};
pub use types::{ExecutionOutcome, FnJob, JobBody, JobError, ReleaseOutcome, SkipReason};

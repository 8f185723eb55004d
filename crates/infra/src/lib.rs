//! Infrastructure layer: state stores, the job lock, the coordinator and
//! notification sinks.

pub mod config;
pub mod jobs;
pub mod notify;
pub mod state_store;

pub use config::{AcquireMode, ConfigError, CoordinatorConfig};
pub use jobs::{
    ABORTED_RELEASE_MESSAGE, Acquisition, CoordinatorError, ExecutionCoordinator, ExecutionOutcome, FnJob, JobBody,
    JobError, Lease, LockError, LockManager, LockPolicy, ReleaseOutcome, SkipReason,
};
pub use notify::{LogNotifier, Notification, NotificationSink, NotifyError, RecordingNotifier};
pub use state_store::{InMemoryStateStore, PostgresStateStore, StateStore, StateStoreError};

#[cfg(feature = "webhook")]
pub use notify::WebhookNotifier;

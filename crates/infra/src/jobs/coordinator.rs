//! Execution coordinator: gate, lock, run the body once, release, notify.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use jobgate_core::{Clock, JobIdentity, JobRecord, SystemClock};

use crate::config::{ConfigError, CoordinatorConfig};
use crate::notify::{LogNotifier, NotificationSink};
use crate::state_store::{StateStore, StateStoreError};

use super::lock::{Acquisition, LockError, LockManager};
use super::types::{ExecutionOutcome, JobBody, ReleaseOutcome};

/// Coordinator error. Skips and job failures are outcomes, not errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<StateStoreError> for CoordinatorError {
    fn from(err: StateStoreError) -> Self {
        Self::Lock(LockError::Store(err))
    }
}

/// Runs job bodies under the single-writer lock of their job record.
///
/// Holds no per-invocation state: every `run` re-reads the store, so any
/// number of processes may share one coordinator configuration.
pub struct ExecutionCoordinator {
    locks: LockManager,
    notifier: Arc<dyn NotificationSink>,
}

impl ExecutionCoordinator {
    pub fn builder(store: Arc<dyn StateStore>) -> ExecutionCoordinatorBuilder {
        ExecutionCoordinatorBuilder {
            store,
            notifier: None,
            clock: None,
            config: CoordinatorConfig::default(),
        }
    }

    /// Create the `IDLE` record of a pre-existing-mode job.
    pub async fn seed(&self, identity: &JobIdentity) -> Result<JobRecord, CoordinatorError> {
        Ok(self.locks.seed(identity).await?)
    }

    pub async fn inspect(
        &self,
        identity: &JobIdentity,
    ) -> Result<Option<JobRecord>, CoordinatorError> {
        Ok(self.locks.inspect(identity).await?)
    }

    /// One invocation for `identity`.
    ///
    /// The body runs at most once and only while this invocation holds the
    /// lock. A failing body yields [`ExecutionOutcome::Failed`]; `Err` is
    /// reserved for store errors and a rejected success release.
    #[instrument(skip_all, fields(identity = %identity, run_id = tracing::field::Empty))]
    pub async fn run<B>(
        &self,
        identity: &JobIdentity,
        body: &B,
    ) -> Result<ExecutionOutcome, CoordinatorError>
    where
        B: JobBody + ?Sized,
    {
        let lease = match self.locks.try_acquire(identity).await? {
            Acquisition::Acquired(lease) => lease,
            Acquisition::Rejected(reason) => {
                info!(%reason, "skipped");
                return Ok(ExecutionOutcome::Skipped {
                    identity: identity.clone(),
                    reason,
                });
            }
        };

        let run_id = lease.run_id();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        info!(token = lease.token(), "executing job body");

        match body.execute().await {
            Ok(result_ref) => {
                let record = lease
                    .release(ReleaseOutcome::Success {
                        result_ref: result_ref.clone(),
                    })
                    .await?;
                info!(
                    version = record.version,
                    run_count = record.run_count,
                    result_ref = ?result_ref,
                    "job succeeded"
                );
                Ok(ExecutionOutcome::Succeeded {
                    identity: identity.clone(),
                    run_id,
                    result_ref,
                    version: record.version,
                    run_count: record.run_count,
                })
            }
            Err(job_err) => {
                let message = job_err.message().to_string();
                error!(error = %message, "job failed");

                let persisted = match lease
                    .release(ReleaseOutcome::Failure {
                        error: message.clone(),
                    })
                    .await
                {
                    Ok(_) => true,
                    Err(release_err) => {
                        error!(
                            secondary = true,
                            error = %release_err,
                            "failed to record job failure"
                        );
                        false
                    }
                };

                if let Err(e) = self.notifier.notify(identity, &message).await {
                    warn!(error = %e, "failure notification not delivered");
                }

                Ok(ExecutionOutcome::Failed {
                    identity: identity.clone(),
                    run_id,
                    error: message,
                    persisted,
                })
            }
        }
    }
}

/// Wires store, clock, notifier and configuration.
pub struct ExecutionCoordinatorBuilder {
    store: Arc<dyn StateStore>,
    notifier: Option<Arc<dyn NotificationSink>>,
    clock: Option<Arc<dyn Clock>>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinatorBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ExecutionCoordinator, ConfigError> {
        self.config.validate()?;
        let limiter = self.config.rate_limiter()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        Ok(ExecutionCoordinator {
            locks: LockManager::new(self.store, clock, limiter, self.config.lock_policy())
                .notify_aborts(notifier.clone()),
            notifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jobgate_core::{JobStatus, ManualClock};

    use crate::jobs::{FnJob, JobError, SkipReason};
    use crate::notify::RecordingNotifier;
    use crate::state_store::InMemoryStateStore;

    fn coordinator(
        config: CoordinatorConfig,
    ) -> (ExecutionCoordinator, Arc<ManualClock>, Arc<RecordingNotifier>) {
        let clock = Arc::new(ManualClock::new(0));
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = ExecutionCoordinator::builder(InMemoryStateStore::arc())
            .clock(clock.clone())
            .notifier(notifier.clone())
            .config(config)
            .build()
            .unwrap();
        (coordinator, clock, notifier)
    }

    #[tokio::test]
    async fn body_runs_once_and_outcome_is_persisted() {
        let (c, _clock, notifier) = coordinator(CoordinatorConfig::default());
        let id = JobIdentity::new("job-x").unwrap();
        c.seed(&id).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let body = FnJob::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, JobError>(Some("out.json".to_string()))
            }
        });

        let outcome = c.run(&id, &body).await.unwrap();
        assert!(outcome.is_succeeded());
        let skipped = c.run(&id, &body).await.unwrap();
        assert!(matches!(
            skipped,
            ExecutionOutcome::Skipped {
                reason: SkipReason::CoolingDown { until: 3600 },
                ..
            }
        ));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn failure_is_an_outcome_and_notifies() {
        let (c, _clock, notifier) = coordinator(CoordinatorConfig::default());
        let id = JobIdentity::new("job-x").unwrap();
        c.seed(&id).await.unwrap();

        let body = FnJob::new(|| async { Err::<Option<String>, _>(JobError::new("upstream 503")) });
        let outcome = c.run(&id, &body).await.unwrap();

        match outcome {
            ExecutionOutcome::Failed {
                error, persisted, ..
            } => {
                assert_eq!(error, "upstream 503");
                assert!(persisted);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let record = c.inspect(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Idle);
        assert_eq!(record.last_error.as_deref(), Some("upstream 503"));
        assert_eq!(record.next_allowed_run, 300);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_fails_build() {
        let result = ExecutionCoordinator::builder(InMemoryStateStore::arc())
            .config(CoordinatorConfig::default().with_windows(60, 60))
            .build();
        assert!(result.is_err());
    }
}

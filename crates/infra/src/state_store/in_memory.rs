use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use jobgate_core::{JobRecord, Precondition, RecordKey, RecordUpdate};

use super::r#trait::{StateStore, StateStoreError};

/// In-memory conditional-write store.
///
/// Intended for tests/dev and single-process dry runs. The write lock makes
/// each conditional write atomic.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<HashMap<RecordKey, JobRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every stored record (inspection/tests).
    pub fn records(&self) -> Result<Vec<JobRecord>, StateStoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StateStoreError::Unavailable("lock poisoned".to_string()))?;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.key.partition.cmp(&b.key.partition));
        Ok(all)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<JobRecord>, StateStoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StateStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(records.get(key).cloned())
    }

    async fn create(&self, record: JobRecord) -> Result<JobRecord, StateStoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StateStoreError::Unavailable("lock poisoned".to_string()))?;

        if records.contains_key(&record.key) {
            return Err(StateStoreError::AlreadyExists(record.key));
        }
        records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        key: &RecordKey,
        precondition: Precondition,
        update: &RecordUpdate,
    ) -> Result<JobRecord, StateStoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StateStoreError::Unavailable("lock poisoned".to_string()))?;

        let current = records
            .get_mut(key)
            .ok_or_else(|| StateStoreError::NotFound(key.clone()))?;

        if !precondition.holds(current) {
            return Err(StateStoreError::PreconditionFailed {
                key: key.clone(),
                expected: precondition,
            });
        }

        *current = update.apply(current);
        Ok(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgate_core::{JobIdentity, JobStatus, KeySchema, RunId};

    fn key(id: &str) -> RecordKey {
        RecordKey::new(JobIdentity::new(id).unwrap(), KeySchema::SingleJob)
    }

    #[tokio::test]
    async fn create_is_conditional_on_absence() {
        let store = InMemoryStateStore::new();
        let first = store.create(JobRecord::idle(key("job-x"))).await.unwrap();
        assert_eq!(first.version, 0);

        let mut clobber = JobRecord::idle(key("job-x"));
        clobber.run_count = 99;
        let err = store.create(clobber).await.unwrap_err();
        assert!(matches!(err, StateStoreError::AlreadyExists(_)));

        let stored = store.get(&key("job-x")).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 0);
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_update_leaves_record_unchanged() {
        let store = InMemoryStateStore::new();
        store.create(JobRecord::idle(key("job-x"))).await.unwrap();
        let before = store.get(&key("job-x")).await.unwrap().unwrap();

        let err = store
            .update(
                &key("job-x"),
                Precondition::status_and_version(JobStatus::Idle, 7),
                &RecordUpdate::acquire(10, RunId::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::PreconditionFailed { .. }));

        let after = store.get(&key("job-x")).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let store = InMemoryStateStore::new();
        let err = store
            .update(
                &key("ghost"),
                Precondition::version(0),
                &RecordUpdate::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Accepted writes advance the version by exactly one; rejected
            /// writes leave it untouched.
            #[test]
            fn version_is_gapless_across_accepted_writes(
                guesses in proptest::collection::vec(0u64..6, 1..40),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let store = InMemoryStateStore::new();
                    store.create(JobRecord::idle(key("job-x"))).await.unwrap();
                    let mut expected = 0u64;

                    for guess in guesses {
                        let fence = if guess == 0 { expected } else { expected + guess };
                        let result = store
                            .update(&key("job-x"), Precondition::version(fence), &RecordUpdate::default())
                            .await;
                        match result {
                            Ok(record) => {
                                prop_assert_eq!(record.version, expected + 1);
                                expected += 1;
                            }
                            Err(StateStoreError::PreconditionFailed { .. }) => {
                                let current = store.get(&key("job-x")).await.unwrap().unwrap();
                                prop_assert_eq!(current.version, expected);
                            }
                            Err(other) => prop_assert!(false, "unexpected error: {other}"),
                        }
                    }
                    Ok(())
                })?;
            }
        }
    }
}

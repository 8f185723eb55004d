//! Postgres-backed state store.
//!
//! Each record is one row of `job_records`, keyed by `(partition_key, sort_key)`.
//! Conditional writes are single statements: the precondition lives in the
//! `WHERE` clause of the `UPDATE`, and creation is `INSERT .. ON CONFLICT DO
//! NOTHING`, so Postgres row locking makes every write atomic without explicit
//! transactions.
//!
//! ## Error Mapping
//!
//! | Condition | PostgreSQL Error Code | StateStoreError |
//! |------------|----------------------|-----------------|
//! | `INSERT .. ON CONFLICT` returning no row | N/A | `AlreadyExists` |
//! | `UPDATE` matching no row, key present | N/A | `PreconditionFailed` |
//! | `UPDATE` matching no row, key absent | N/A | `NotFound` |
//! | Database (check violation, other) | Any | `Backend` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | Other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use jobgate_core::{
    JobIdentity, JobRecord, JobStatus, Precondition, RecordKey, RecordUpdate, RunId,
};

use super::r#trait::{StateStore, StateStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_records (
    partition_key        TEXT        NOT NULL,
    sort_key             TEXT        NOT NULL DEFAULT '',
    status               TEXT        NOT NULL,
    version              BIGINT      NOT NULL CHECK (version >= 0),
    last_run_ts          BIGINT,
    last_run_id          UUID,
    last_success_ts      BIGINT,
    completed_at         BIGINT,
    next_allowed_run     BIGINT      NOT NULL DEFAULT 0,
    run_count            BIGINT      NOT NULL DEFAULT 0,
    consecutive_failures INTEGER     NOT NULL DEFAULT 0,
    last_error           TEXT        CHECK (char_length(last_error) <= 500),
    result_ref           TEXT,
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (partition_key, sort_key)
)
"#;

const RECORD_COLUMNS: &str = r#"
    partition_key,
    sort_key,
    status,
    version,
    last_run_ts,
    last_run_id,
    last_success_ts,
    completed_at,
    next_allowed_run,
    run_count,
    consecutive_failures,
    last_error,
    result_ref
"#;

/// Postgres-backed conditional-write store.
///
/// `PostgresStateStore` is `Send + Sync`; all operations go through the SQLx
/// connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: Arc<PgPool>,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `job_records` table if it does not exist.
    pub async fn migrate(&self) -> Result<(), StateStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn fetch(&self, key: &RecordKey) -> Result<Option<JobRecord>, StateStoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM job_records WHERE partition_key = $1 AND sort_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(key.partition.as_str())
            .bind(&key.sort)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;

        row.map(|row| decode_record(&row)).transpose()
    }

    #[instrument(skip(self, record), fields(key = %record.key, status = %record.status), err)]
    pub async fn insert_if_absent(&self, record: JobRecord) -> Result<JobRecord, StateStoreError> {
        let sql = format!(
            r#"
            INSERT INTO job_records ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (partition_key, sort_key) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(record.key.partition.as_str())
            .bind(&record.key.sort)
            .bind(record.status.as_str())
            .bind(to_i64(record.version)?)
            .bind(record.last_run_ts)
            .bind(record.last_run_id.map(|id| *id.as_uuid()))
            .bind(record.last_success_ts)
            .bind(record.completed_at)
            .bind(record.next_allowed_run)
            .bind(to_i64(record.run_count)?)
            .bind(to_i32(record.consecutive_failures)?)
            .bind(record.last_error.as_deref())
            .bind(record.result_ref.as_deref())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_if_absent", e))?;

        match row {
            Some(row) => decode_record(&row),
            None => Err(StateStoreError::AlreadyExists(record.key)),
        }
    }

    #[instrument(
        skip(self, update),
        fields(
            key = %key,
            expected_version = precondition.version,
            accepted = tracing::field::Empty
        ),
        err
    )]
    pub async fn conditional_update(
        &self,
        key: &RecordKey,
        precondition: Precondition,
        update: &RecordUpdate,
    ) -> Result<JobRecord, StateStoreError> {
        let sql = format!(
            r#"
            UPDATE job_records SET
                status               = COALESCE($3, status),
                version              = version + 1,
                last_run_ts          = COALESCE($4, last_run_ts),
                last_run_id          = COALESCE($5, last_run_id),
                last_success_ts      = COALESCE($6, last_success_ts),
                completed_at         = COALESCE($7, completed_at),
                next_allowed_run     = COALESCE($8, next_allowed_run),
                run_count            = run_count + CASE WHEN $9 THEN 1 ELSE 0 END,
                consecutive_failures = COALESCE($10, consecutive_failures),
                last_error           = COALESCE($11, last_error),
                result_ref           = COALESCE($12, result_ref),
                updated_at           = NOW()
            WHERE partition_key = $1
              AND sort_key = $2
              AND version = $13
              AND ($14::text IS NULL OR status = $14)
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(key.partition.as_str())
            .bind(&key.sort)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.last_run_ts)
            .bind(update.last_run_id.map(|id| *id.as_uuid()))
            .bind(update.last_success_ts)
            .bind(update.completed_at)
            .bind(update.next_allowed_run)
            .bind(update.increment_run_count)
            .bind(update.consecutive_failures.map(to_i32).transpose()?)
            .bind(update.last_error.as_deref())
            .bind(update.result_ref.as_deref())
            .bind(to_i64(precondition.version)?)
            .bind(precondition.status.map(|s| s.as_str()))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("conditional_update", e))?;

        let span = Span::current();
        match row {
            Some(row) => {
                span.record("accepted", true);
                decode_record(&row)
            }
            None => {
                span.record("accepted", false);
                // Only classifies the rejection; the write itself was atomic.
                let lookup = self.fetch(key).await;
                Err(classify_rejection(key, precondition, lookup))
            }
        }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<JobRecord>, StateStoreError> {
        self.fetch(key).await
    }

    async fn create(&self, record: JobRecord) -> Result<JobRecord, StateStoreError> {
        self.insert_if_absent(record).await
    }

    async fn update(
        &self,
        key: &RecordKey,
        precondition: Precondition,
        update: &RecordUpdate,
    ) -> Result<JobRecord, StateStoreError> {
        self.conditional_update(key, precondition, update).await
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRecordRow {
    partition_key: String,
    sort_key: String,
    status: String,
    version: i64,
    last_run_ts: Option<i64>,
    last_run_id: Option<Uuid>,
    last_success_ts: Option<i64>,
    completed_at: Option<i64>,
    next_allowed_run: i64,
    run_count: i64,
    consecutive_failures: i32,
    last_error: Option<String>,
    result_ref: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for JobRecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRecordRow {
            partition_key: row.try_get("partition_key")?,
            sort_key: row.try_get("sort_key")?,
            status: row.try_get("status")?,
            version: row.try_get("version")?,
            last_run_ts: row.try_get("last_run_ts")?,
            last_run_id: row.try_get("last_run_id")?,
            last_success_ts: row.try_get("last_success_ts")?,
            completed_at: row.try_get("completed_at")?,
            next_allowed_run: row.try_get("next_allowed_run")?,
            run_count: row.try_get("run_count")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            last_error: row.try_get("last_error")?,
            result_ref: row.try_get("result_ref")?,
        })
    }
}

impl TryFrom<JobRecordRow> for JobRecord {
    type Error = StateStoreError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        let partition = JobIdentity::new(row.partition_key)
            .map_err(|e| StateStoreError::Corrupt(e.to_string()))?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: jobgate_core::DomainError| StateStoreError::Corrupt(e.to_string()))?;

        Ok(JobRecord {
            key: RecordKey {
                partition,
                sort: row.sort_key,
            },
            status,
            version: to_u64("version", row.version)?,
            last_run_ts: row.last_run_ts,
            last_run_id: row.last_run_id.map(RunId::from_uuid),
            last_success_ts: row.last_success_ts,
            completed_at: row.completed_at,
            next_allowed_run: row.next_allowed_run,
            run_count: to_u64("run_count", row.run_count)?,
            consecutive_failures: u32::try_from(row.consecutive_failures).map_err(|_| {
                StateStoreError::Corrupt(format!(
                    "negative consecutive_failures: {}",
                    row.consecutive_failures
                ))
            })?,
            last_error: row.last_error,
            result_ref: row.result_ref,
        })
    }
}

fn decode_record(row: &PgRow) -> Result<JobRecord, StateStoreError> {
    let row = JobRecordRow::from_row(row)
        .map_err(|e| StateStoreError::Corrupt(format!("failed to decode job record row: {e}")))?;
    JobRecord::try_from(row)
}

fn to_u64(column: &str, value: i64) -> Result<u64, StateStoreError> {
    u64::try_from(value)
        .map_err(|_| StateStoreError::Corrupt(format!("negative {column}: {value}")))
}

fn to_i32(value: u32) -> Result<i32, StateStoreError> {
    i32::try_from(value)
        .map_err(|_| StateStoreError::Backend(format!("value out of INTEGER range: {value}")))
}

/// Classify an `UPDATE` that matched no row.
///
/// A failed lookup is reported as `PreconditionFailed`: the guarded write was
/// rejected either way, and a lost race must stay a skip.
fn classify_rejection(
    key: &RecordKey,
    precondition: Precondition,
    lookup: Result<Option<JobRecord>, StateStoreError>,
) -> StateStoreError {
    match lookup {
        Ok(None) => StateStoreError::NotFound(key.clone()),
        Ok(Some(_)) => StateStoreError::PreconditionFailed {
            key: key.clone(),
            expected: precondition,
        },
        Err(e) => {
            warn!(key = %key, error = %e, "could not classify rejected update; assuming precondition failure");
            StateStoreError::PreconditionFailed {
                key: key.clone(),
                expected: precondition,
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64, StateStoreError> {
    i64::try_from(value)
        .map_err(|_| StateStoreError::Backend(format!("value out of BIGINT range: {value}")))
}

/// Map SQLx errors to StateStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StateStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StateStoreError::Backend(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StateStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => {
            StateStoreError::Unavailable(format!("io error in {operation}: {e}"))
        }
        sqlx::Error::Tls(e) => {
            StateStoreError::Unavailable(format!("tls error in {operation}: {e}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StateStoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => StateStoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

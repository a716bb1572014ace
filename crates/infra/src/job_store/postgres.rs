//! Postgres-backed job repository.
//!
//! One row per job record in `bulk_jobs`. Mutations are read-modify-write
//! cycles guarded by the `version` column:
//!
//! 1. `SELECT` the row
//! 2. run the aggregate's `handle` + `apply` in memory
//! 3. `UPDATE ... WHERE id = $1 AND version = $old`
//!
//! If step 3 matches no row another writer got there first, and the cycle is
//! retried against the fresh row. Counter updates therefore never lose an
//! increment and only one writer can observe the 1 -> 0 decrement.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert, `Storage` otherwise |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, Span};

use async_trait::async_trait;

use bulkmsg_core::{Aggregate, JobId, SenderId};
use bulkmsg_messaging::{BodyFormat, BulkJob, JobCommand, JobStatus, MessagePayload, RecipientSelection};

use super::r#trait::{Executed, JobPage, JobRepository, JobStoreError, PageRequest};

/// Compare-and-swap attempts before `execute` gives up with `Concurrency`.
const MAX_CAS_ATTEMPTS: u32 = 64;
const CAS_BACKOFF_BASE_MICROS: u64 = 1_000;
const CAS_BACKOFF_MAX_MICROS: u64 = 50_000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bulk_jobs (
    id                 UUID PRIMARY KEY,
    status             SMALLINT NOT NULL,
    run                INTEGER NOT NULL,
    recipient_count    BIGINT NOT NULL CHECK (recipient_count >= 0),
    sent_count         BIGINT NOT NULL CHECK (sent_count >= 0),
    failed_count       BIGINT NOT NULL CHECK (failed_count >= 0),
    remaining_batches  BIGINT NOT NULL CHECK (remaining_batches >= 0),
    subject            TEXT NOT NULL,
    body               TEXT NOT NULL,
    body_format        SMALLINT NOT NULL,
    sender_id          UUID NOT NULL,
    selection          JSONB NOT NULL,
    filter_description TEXT NOT NULL,
    created_at         TIMESTAMPTZ NOT NULL,
    completed_at       TIMESTAMPTZ NULL,
    failure_reason     TEXT NULL,
    version            BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS bulk_jobs_created_at_idx ON bulk_jobs (created_at DESC, id DESC);
"#;

const SELECT_COLUMNS: &str = r#"
    id, status, run, recipient_count, sent_count, failed_count, remaining_batches,
    subject, body, body_format, sender_id, selection, filter_description,
    created_at, completed_at, failure_reason, version
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `bulk_jobs` table and its index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM bulk_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Write `job` back if the stored version is still `expected_version`.
    async fn compare_and_swap(&self, job: &BulkJob, expected_version: u64) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_jobs SET
                status = $2,
                run = $3,
                recipient_count = $4,
                sent_count = $5,
                failed_count = $6,
                remaining_batches = $7,
                completed_at = $8,
                failure_reason = $9,
                version = $10
            WHERE id = $1 AND version = $11
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.code())
        .bind(job.run as i32)
        .bind(to_i64(job.recipient_count)?)
        .bind(to_i64(job.sent_count)?)
        .bind(to_i64(job.failed_count)?)
        .bind(to_i64(job.remaining_batches)?)
        .bind(job.completed_at)
        .bind(job.failure_reason.as_deref())
        .bind(to_i64(job.version)?)
        .bind(to_i64(expected_version)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: &BulkJob) -> Result<(), JobStoreError> {
        let selection = serde_json::to_value(&job.selection)
            .map_err(|e| JobStoreError::Corrupt(format!("failed to serialize selection: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO bulk_jobs (
                id, status, run, recipient_count, sent_count, failed_count, remaining_batches,
                subject, body, body_format, sender_id, selection, filter_description,
                created_at, completed_at, failure_reason, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.code())
        .bind(job.run as i32)
        .bind(to_i64(job.recipient_count)?)
        .bind(to_i64(job.sent_count)?)
        .bind(to_i64(job.failed_count)?)
        .bind(to_i64(job.remaining_batches)?)
        .bind(&job.payload.subject)
        .bind(&job.payload.body)
        .bind(job.payload.format.code())
        .bind(job.sender_id.as_uuid())
        .bind(&selection)
        .bind(&job.filter_description)
        .bind(job.created_at)
        .bind(job.completed_at)
        .bind(job.failure_reason.as_deref())
        .bind(to_i64(job.version)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn load(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        self.fetch(id).await
    }

    #[instrument(skip(self), fields(job_id = %id, attempts = tracing::field::Empty), err)]
    async fn execute(
        &self,
        id: JobId,
        command: JobCommand,
    ) -> Result<Option<Executed>, JobStoreError> {
        let span = Span::current();

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(mut job) = self.fetch(id).await? else {
                return Ok(None);
            };

            let expected_version = job.version;
            let events = job.execute(&command)?;
            if events.is_empty() {
                span.record("attempts", attempt);
                return Ok(Some(Executed { events, job }));
            }

            if self.compare_and_swap(&job, expected_version).await? {
                span.record("attempts", attempt);
                return Ok(Some(Executed { events, job }));
            }

            let delay = cas_backoff(attempt);
            debug!(job_id = %id, attempt, ?delay, "version conflict, retrying");
            tokio::time::sleep(delay).await;
        }

        Err(JobStoreError::Concurrency(format!(
            "job {id} still contended after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete_terminal(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(job) = self.fetch(id).await? else {
                return Ok(None);
            };
            job.ensure_deletable()?;

            let result = sqlx::query("DELETE FROM bulk_jobs WHERE id = $1 AND version = $2")
                .bind(id.as_uuid())
                .bind(to_i64(job.version)?)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete", e))?;

            if result.rows_affected() == 1 {
                return Ok(Some(job));
            }
        }

        Err(JobStoreError::Concurrency(format!(
            "job {id} still contended after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    #[instrument(skip(self), fields(page = page.page, per_page = page.per_page), err)]
    async fn list(&self, page: PageRequest) -> Result<JobPage, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM bulk_jobs ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(page.per_page as i64)
        .bind(to_i64(page.offset())?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bulk_jobs")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;

        let items = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            items,
            total: total.max(0) as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<BulkJob, JobStoreError> {
    let corrupt = |e: sqlx::Error| JobStoreError::Corrupt(format!("failed to decode bulk_jobs row: {e}"));

    let status_code: i16 = row.try_get("status").map_err(corrupt)?;
    let status = JobStatus::from_code(status_code)
        .ok_or_else(|| JobStoreError::Corrupt(format!("unknown status code {status_code}")))?;

    let format_code: i16 = row.try_get("body_format").map_err(corrupt)?;
    let format = BodyFormat::from_code(format_code)
        .ok_or_else(|| JobStoreError::Corrupt(format!("unknown body format {format_code}")))?;

    let selection: serde_json::Value = row.try_get("selection").map_err(corrupt)?;
    let selection: RecipientSelection = serde_json::from_value(selection)
        .map_err(|e| JobStoreError::Corrupt(format!("invalid selection: {e}")))?;

    let run: i32 = row.try_get("run").map_err(corrupt)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(corrupt)?;

    Ok(BulkJob {
        id: JobId::from_uuid(row.try_get("id").map_err(corrupt)?),
        status,
        run: run.max(0) as u32,
        recipient_count: to_u64(row.try_get("recipient_count").map_err(corrupt)?),
        sent_count: to_u64(row.try_get("sent_count").map_err(corrupt)?),
        failed_count: to_u64(row.try_get("failed_count").map_err(corrupt)?),
        remaining_batches: to_u64(row.try_get("remaining_batches").map_err(corrupt)?),
        // Stored payloads were validated on the way in.
        payload: MessagePayload {
            subject: row.try_get("subject").map_err(corrupt)?,
            body: row.try_get("body").map_err(corrupt)?,
            format,
        },
        sender_id: SenderId::from_uuid(row.try_get("sender_id").map_err(corrupt)?),
        selection,
        filter_description: row.try_get("filter_description").map_err(corrupt)?,
        created_at,
        completed_at: row.try_get("completed_at").map_err(corrupt)?,
        failure_reason: row.try_get("failure_reason").map_err(corrupt)?,
        version: to_u64(row.try_get("version").map_err(corrupt)?),
    })
}

/// Full-jitter exponential delay after the `attempt`-th lost compare-and-swap,
/// so contending writers spread out instead of colliding again.
fn cas_backoff(attempt: u32) -> Duration {
    let ceiling = (CAS_BACKOFF_BASE_MICROS << attempt.min(10)).min(CAS_BACKOFF_MAX_MICROS);
    Duration::from_micros(rand::random::<u64>() % (ceiling + 1))
}

fn to_i64(value: u64) -> Result<i64, JobStoreError> {
    i64::try_from(value).map_err(|_| JobStoreError::Corrupt(format!("value {value} exceeds BIGINT")))
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    //! The `#[ignore]` tests need a reachable Postgres in `DATABASE_URL`:
    //! `cargo test -p bulkmsg-infra -- --ignored`

    use std::sync::Arc;

    use super::*;
    use bulkmsg_core::RecipientId;
    use bulkmsg_messaging::{BatchSize, NewBulkJob};

    async fn repo() -> PostgresJobRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
        let pool = PgPool::connect(&url).await.expect("connect to postgres");
        let repo = PostgresJobRepository::new(pool);
        repo.ensure_schema().await.expect("schema");
        repo
    }

    fn job(recipients: u64, batch_size: usize) -> BulkJob {
        let request = NewBulkJob {
            payload: MessagePayload::new("Subject", "<p>Body</p>", BodyFormat::Html).unwrap(),
            sender_id: SenderId::new(),
            selection: RecipientSelection::List(vec![RecipientId::new(7)]),
            filter_description: Some("uploaded list".into()),
            recipients: (1..=recipients).map(RecipientId::new).collect(),
        };
        BulkJob::queued(
            JobId::new(),
            &request,
            recipients,
            BatchSize::new(batch_size).unwrap(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn cas_backoff_grows_and_stays_bounded() {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            for _ in 0..50 {
                assert!(cas_backoff(attempt) <= Duration::from_micros(CAS_BACKOFF_MAX_MICROS));
            }
        }
        for _ in 0..50 {
            assert!(cas_backoff(1) <= Duration::from_micros(2 * CAS_BACKOFF_BASE_MICROS));
        }
    }

    #[tokio::test]
    #[ignore]
    async fn stores_and_loads_a_record() {
        let repo = repo().await;
        let job = job(120, 50);
        repo.insert(&job).await.unwrap();

        let loaded = repo.load(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.selection, job.selection);
        assert_eq!(loaded.remaining_batches, 3);
        assert_eq!(loaded.payload, job.payload);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    #[ignore]
    async fn concurrent_batches_complete_exactly_once() {
        let repo = Arc::new(repo().await);
        let job = job(40, 1);
        repo.insert(&job).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let repo = repo.clone();
            let id = job.id;
            handles.push(tokio::spawn(async move {
                repo.execute(
                    id,
                    JobCommand::RecordBatch {
                        run: 1,
                        sent: 1,
                        failed: 0,
                        at: Utc::now(),
                    },
                )
                .await
                .unwrap()
                .unwrap()
                .completed()
            }));
        }

        let mut completions = 0;
        for h in handles {
            if h.await.unwrap() {
                completions += 1;
            }
        }

        let stored = repo.load(job.id).await.unwrap().unwrap();
        assert_eq!(completions, 1);
        assert_eq!(stored.sent_count, 40);
        assert_eq!(stored.remaining_batches, 0);
        assert_eq!(stored.status, JobStatus::Completed);
    }
}

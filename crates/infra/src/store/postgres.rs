//! Postgres-backed job store.
//!
//! Jobs and requests live in `loyaltysync_jobs` / `loyaltysync_requests`
//! (see [`MIGRATION`]). Ids come from `BIGSERIAL`, so a lower job id still
//! means an earlier job.
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous. The store owns a small tokio runtime and
//! blocks on it for every call, so it must be used from plain threads (the
//! digest scheduler thread, a CLI), not from inside another tokio runtime.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any code) | `Storage` |
//! | ColumnDecode / ColumnNotFound | `Corrupt` |
//! | PoolClosed, PoolTimedOut, Io, other | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{debug, instrument};

use loyaltysync_core::{Job, JobId, NewJob, NewRequest, Request, RequestId, StoreId, TypeCode};

use super::r#trait::{JobStats, JobStore, StoreError};

/// Bundled schema; idempotent.
pub const MIGRATION: &str = include_str!("../../migrations/0001_loyaltysync.sql");

const JOB_COLUMNS: &str = "id, relation_id, source_id, store_id, completed, created_at, updated_at";
const REQUEST_COLUMNS: &str =
    "id, job_id, type_code, payload, is_synced, attempt, latest_fail_reason, result, created_at, updated_at";

/// Postgres job store.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresJobStore {
    /// Connect to `url` with a pool of at most `max_connections`.
    pub fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("loyaltysync-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Storage(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(PgPoolOptions::new().max_connections(max_connections).connect(url))
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    /// Apply [`MIGRATION`].
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.runtime
            .block_on(sqlx::raw_sql(MIGRATION).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        debug!("loyaltysync schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_job_tx(tx: &mut Transaction<'_, Postgres>, job: NewJob) -> Result<Job, StoreError> {
        let store_id = job.store_id.map(store_to_db).transpose()?;
        let row = sqlx::query(
            r#"
            INSERT INTO loyaltysync_jobs (relation_id, source_id, store_id, completed, created_at, updated_at)
            VALUES ($1, $2, $3, FALSE, $4, $4)
            RETURNING id
            "#,
        )
        .bind(&job.relation_id)
        .bind(&job.source_id)
        .bind(store_id)
        .bind(job.created_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        let id = id_from_db(column(&row, "id")?)?;
        Ok(job.into_job(JobId::new(id)))
    }

    async fn insert_request_tx(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        request: NewRequest,
    ) -> Result<Request, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO loyaltysync_requests (job_id, type_code, payload, is_synced, attempt, created_at, updated_at)
            SELECT $1, $2, $3, FALSE, 0, $4, $4
            WHERE EXISTS (SELECT 1 FROM loyaltysync_jobs WHERE id = $1)
            RETURNING id
            "#,
        )
        .bind(id_to_db(job_id.get())?)
        .bind(request.type_code.as_str())
        .bind(JsonValue::Object(request.payload.clone()))
        .bind(request.created_at)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_request", e))?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let id = id_from_db(column(&row, "id")?)?;
        Ok(request.into_request(RequestId::new(id), job_id))
    }

    async fn insert_all(&self, job: NewJob, requests: Vec<NewRequest>) -> Result<(Job, Vec<Request>), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let job = Self::insert_job_tx(&mut tx, job).await?;
        let mut persisted = Vec::with_capacity(requests.len());
        for request in requests {
            persisted.push(Self::insert_request_tx(&mut tx, job.id, request).await?);
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok((job, persisted))
    }

    async fn insert_one_request(&self, job_id: JobId, request: NewRequest) -> Result<Request, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        let request = Self::insert_request_tx(&mut tx, job_id, request).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(request)
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let store_id = job.store_id.map(store_to_db).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE loyaltysync_jobs
            SET relation_id = $2, source_id = $3, store_id = $4, completed = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id_to_db(job.id.get())?)
        .bind(&job.relation_id)
        .bind(&job.source_id)
        .bind(store_id)
        .bind(job.completed)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    async fn update_request(&self, request: &Request) -> Result<(), StoreError> {
        let attempt = i32::try_from(request.attempt)
            .map_err(|_| StoreError::Corrupt(format!("attempt out of range: {}", request.attempt)))?;
        let result = sqlx::query(
            r#"
            UPDATE loyaltysync_requests
            SET payload = $2, is_synced = $3, attempt = $4, latest_fail_reason = $5, result = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id_to_db(request.id.get())?)
        .bind(JsonValue::Object(request.payload.clone()))
        .bind(request.is_synced)
        .bind(attempt)
        .bind(&request.latest_fail_reason)
        .bind(&request.result)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_request", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RequestNotFound(request.id));
        }
        Ok(())
    }

    async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM loyaltysync_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id_to_db(job_id.get())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn fetch_request(&self, request_id: RequestId) -> Result<Option<Request>, StoreError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM loyaltysync_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id_to_db(request_id.get())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_request", e))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn fetch_requests_for(&self, job_id: JobId) -> Result<Vec<Request>, StoreError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM loyaltysync_requests WHERE job_id = $1 ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(id_to_db(job_id.get())?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("requests_for", e))?;
        rows.iter().map(request_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn fetch_due_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM loyaltysync_jobs WHERE NOT completed ORDER BY id ASC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_due_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn fetch_due_jobs_after(&self, after: JobId, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM loyaltysync_jobs WHERE NOT completed AND id > $1 ORDER BY id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(id_to_db(after.get())?)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_due_jobs_after", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn pending_request_exists(&self, relation_id: &str, type_code: &TypeCode) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM loyaltysync_requests r
                JOIN loyaltysync_jobs j ON j.id = r.job_id
                WHERE j.relation_id = $1 AND NOT j.completed
                  AND r.type_code = $2 AND NOT r.is_synced
            ) AS pending
            "#,
        )
        .bind(relation_id)
        .bind(type_code.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_pending_request", e))?;
        column(&row, "pending")
    }

    async fn parent_exists(&self, job: &Job) -> Result<bool, StoreError> {
        let Some(relation_id) = &job.relation_id else {
            return Ok(false);
        };
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM loyaltysync_jobs
                WHERE relation_id = $1 AND id < $2 AND NOT completed
            ) AS parent
            "#,
        )
        .bind(relation_id)
        .bind(id_to_db(job.id.get())?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_uncompleted_parent", e))?;
        column(&row, "parent")
    }

    #[instrument(skip(self), err)]
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM loyaltysync_jobs WHERE completed AND updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_completed_older_than", e))?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn fetch_stats(&self, max_retries: u32) -> Result<JobStats, StoreError> {
        let jobs = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT completed) AS open_jobs,
                COUNT(*) FILTER (WHERE completed) AS completed_jobs
            FROM loyaltysync_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let requests = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT is_synced) AS pending,
                COUNT(*) FILTER (WHERE NOT is_synced AND attempt > 0) AS failing,
                COUNT(*) FILTER (WHERE NOT is_synced AND attempt::BIGINT - 1 >= $1) AS stuck
            FROM loyaltysync_requests
            "#,
        )
        .bind(i64::from(max_retries))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        Ok(JobStats {
            open_jobs: count(&jobs, "open_jobs")?,
            completed_jobs: count(&jobs, "completed_jobs")?,
            pending_requests: count(&requests, "pending")?,
            failing_requests: count(&requests, "failing")?,
            stuck_requests: count(&requests, "stuck")?,
        })
    }
}

impl JobStore for PostgresJobStore {
    fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        self.runtime
            .block_on(self.insert_all(job, Vec::new()))
            .map(|(job, _)| job)
    }

    fn insert_request(&self, job_id: JobId, request: NewRequest) -> Result<Request, StoreError> {
        self.runtime.block_on(self.insert_one_request(job_id, request))
    }

    fn insert_job_with_requests(
        &self,
        job: NewJob,
        requests: Vec<NewRequest>,
    ) -> Result<(Job, Vec<Request>), StoreError> {
        self.runtime.block_on(self.insert_all(job, requests))
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.runtime.block_on(self.update_job(job))
    }

    fn save_request(&self, request: &Request) -> Result<(), StoreError> {
        self.runtime.block_on(self.update_request(request))
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.runtime.block_on(self.fetch_job(job_id))
    }

    fn get_request(&self, request_id: RequestId) -> Result<Option<Request>, StoreError> {
        self.runtime.block_on(self.fetch_request(request_id))
    }

    fn requests_for(&self, job_id: JobId) -> Result<Vec<Request>, StoreError> {
        self.runtime.block_on(self.fetch_requests_for(job_id))
    }

    fn find_due_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.runtime.block_on(self.fetch_due_jobs(limit))
    }

    fn find_due_jobs_after(&self, after: JobId, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.runtime.block_on(self.fetch_due_jobs_after(after, limit))
    }

    fn has_uncompleted_parent(&self, job: &Job) -> Result<bool, StoreError> {
        self.runtime.block_on(self.parent_exists(job))
    }

    fn has_pending_request(&self, relation_id: &str, type_code: &TypeCode) -> Result<bool, StoreError> {
        self.runtime.block_on(self.pending_request_exists(relation_id, type_code))
    }

    fn delete_completed_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.runtime.block_on(self.delete_expired(cutoff))
    }

    fn stats(&self, max_retries: u32) -> Result<JobStats, StoreError> {
        self.runtime.block_on(self.fetch_stats(max_retries))
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {name}: {e}")))
}

fn count(row: &PgRow, name: &str) -> Result<usize, StoreError> {
    let value: i64 = column(row, name)?;
    usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count in {name}")))
}

fn id_to_db(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Corrupt(format!("id out of range: {id}")))
}

fn id_from_db(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::Corrupt(format!("negative id: {id}")))
}

fn store_to_db(store_id: StoreId) -> Result<i32, StoreError> {
    i32::try_from(store_id.get()).map_err(|_| StoreError::Corrupt(format!("store id out of range: {store_id}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let store_id: Option<i32> = column(row, "store_id")?;
    let store_id = store_id
        .map(|v| u32::try_from(v).map(StoreId::new))
        .transpose()
        .map_err(|_| StoreError::Corrupt("negative store id".to_string()))?;

    Ok(Job {
        id: JobId::new(id_from_db(column(row, "id")?)?),
        relation_id: column(row, "relation_id")?,
        source_id: column(row, "source_id")?,
        store_id,
        completed: column(row, "completed")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<Request, StoreError> {
    let payload = match column::<JsonValue>(row, "payload")? {
        JsonValue::Object(map) => map,
        other => return Err(StoreError::Corrupt(format!("payload is not an object: {other}"))),
    };
    let attempt: i32 = column(row, "attempt")?;
    let type_code: String = column(row, "type_code")?;

    Ok(Request {
        id: RequestId::new(id_from_db(column(row, "id")?)?),
        job_id: JobId::new(id_from_db(column(row, "job_id")?)?),
        type_code: TypeCode::new(type_code),
        payload,
        is_synced: column(row, "is_synced")?,
        attempt: u32::try_from(attempt).map_err(|_| StoreError::Corrupt(format!("negative attempt: {attempt}")))?,
        latest_fail_reason: column(row, "latest_fail_reason")?,
        result: column(row, "result")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Storage(format!("database error in {operation} ({code}): {}", db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

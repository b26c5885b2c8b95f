//! Job queries: submit with dedup, atomic claim, terminal writes.
//!
//! Each query is a free function over an explicit `&mut PgConnection`, so the
//! same statement runs against a pooled connection or inside a transaction.
//! The [`JobStore`] impl for [`Db`] decides which.

use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::JobStore;

use super::Db;

#[async_trait]
impl JobStore for Db {
    async fn insert_or_replace(
        &self,
        payload: serde_json::Value,
        dedup_key: Option<String>,
        on_in_flight: InFlightPolicy,
    ) -> Result<Submitted> {
        let Some(key) = dedup_key else {
            let mut conn = self.pool().acquire().await?;
            let job = insert_on(&mut conn, &payload, None).await?;
            return Ok(Submitted {
                job,
                disposition: Disposition::Created,
            });
        };

        let mut tx = self.pool().begin().await?;

        // A still-queued duplicate is superseded in place. The row lock taken
        // by a concurrent claim makes this wait, after which the status
        // predicate no longer matches and the claimed row is left alone.
        if let Some(job) = replace_queued_on(&mut tx, &key, &payload).await? {
            tx.commit().await?;
            return Ok(Submitted {
                job,
                disposition: Disposition::Replaced,
            });
        }

        if on_in_flight == InFlightPolicy::Reject {
            if let Some(existing) = find_processing_on(&mut tx, &key).await? {
                return Err(Error::Conflict { existing });
            }
        }

        // A concurrent submitter may have queued the same key since the
        // replace above; the partial unique index turns that race into a
        // replace as well.
        let (job, inserted) = upsert_on(&mut tx, &payload, &key).await?;
        tx.commit().await?;

        Ok(Submitted {
            job,
            disposition: if inserted {
                Disposition::Created
            } else {
                Disposition::Replaced
            },
        })
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut conn = self.pool().acquire().await?;
        claim_on(&mut conn, worker_id).await
    }

    async fn finish(&self, id: JobId, outcome: &Outcome) -> Result<Job> {
        let mut conn = self.pool().acquire().await?;
        if let Some(job) = finish_on(&mut conn, id, outcome).await? {
            return Ok(job);
        }

        // Nothing matched: either the id is unknown or the job is not processing.
        let current = get_on(&mut conn, id).await?;
        Err(Error::InvalidTransition {
            from: current.status,
            to: outcome.status(),
        })
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let mut conn = self.pool().acquire().await?;
        get_on(&mut conn, id).await
    }

    async fn list(&self, status: Option<Status>, limit: usize) -> Result<Vec<Job>> {
        let mut conn = self.pool().acquire().await?;
        list_on(&mut conn, status, limit).await
    }

    async fn health_check(&self) -> Result<()> {
        Db::health_check(self).await
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

const RETURNING: &str = "RETURNING id, payload, dedup_key, status, worker_id, attempt_count, created_at, started_at, completed_at, last_error";

/// Insert a fresh queued job. The store assigns id and created_at.
pub async fn insert_on(
    conn: &mut PgConnection,
    payload: &serde_json::Value,
    dedup_key: Option<&str>,
) -> Result<Job> {
    let row: JobRow = sqlx::query_as(&format!(
        "INSERT INTO jobs (payload, dedup_key) VALUES ($1, $2) {RETURNING}"
    ))
    .bind(payload)
    .bind(dedup_key)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into_job()
}

/// Overwrite the payload of the queued job holding `key` and reset its
/// creation time. Returns `None` if no queued job holds the key.
pub async fn replace_queued_on(
    conn: &mut PgConnection,
    key: &str,
    payload: &serde_json::Value,
) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "UPDATE jobs SET payload = $2, created_at = now()
         WHERE dedup_key = $1 AND status = 'queued'
         {RETURNING}"
    ))
    .bind(key)
    .bind(payload)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(JobRow::try_into_job).transpose()
}

/// Insert a queued job for `key`, or replace the queued one that won a race.
/// The flag is true when a new row was inserted.
pub async fn upsert_on(
    conn: &mut PgConnection,
    payload: &serde_json::Value,
    key: &str,
) -> Result<(Job, bool)> {
    let row: UpsertRow = sqlx::query_as(&format!(
        "INSERT INTO jobs (payload, dedup_key) VALUES ($1, $2)
         ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL AND status = 'queued'
         DO UPDATE SET payload = EXCLUDED.payload, created_at = now()
         {RETURNING}, (xmax = 0) AS inserted"
    ))
    .bind(payload)
    .bind(key)
    .fetch_one(&mut *conn)
    .await?;
    Ok((row.job.try_into_job()?, row.inserted))
}

/// The oldest processing job holding `key`, if any.
pub async fn find_processing_on(conn: &mut PgConnection, key: &str) -> Result<Option<JobId>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM jobs
         WHERE dedup_key = $1 AND status = 'processing'
         ORDER BY created_at, id
         LIMIT 1",
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(id,)| JobId(id)))
}

/// Claim the oldest queued job for `worker_id`.
///
/// Selection and transition happen in one statement. `SKIP LOCKED` removes
/// rows locked by concurrent claimers from this claimer's candidate set, so
/// racing workers partition the backlog instead of queueing behind one row.
/// The lock is released when the statement's implicit transaction ends.
pub async fn claim_on(conn: &mut PgConnection, worker_id: &str) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "UPDATE jobs
         SET status = 'processing',
             worker_id = $1,
             started_at = now(),
             attempt_count = attempt_count + 1
         WHERE id = (
             SELECT id FROM jobs
             WHERE status = 'queued'
             ORDER BY created_at, id
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         AND status = 'queued'
         {RETURNING}"
    ))
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(JobRow::try_into_job).transpose()
}

/// Write a terminal status for a processing job. Returns `None` if the job
/// is unknown or not processing.
pub async fn finish_on(
    conn: &mut PgConnection,
    id: JobId,
    outcome: &Outcome,
) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "UPDATE jobs SET status = $2, completed_at = now(), last_error = $3
         WHERE id = $1 AND status = 'processing'
         {RETURNING}"
    ))
    .bind(id.0)
    .bind(outcome.status().as_str())
    .bind(outcome.error())
    .fetch_optional(&mut *conn)
    .await?;
    row.map(JobRow::try_into_job).transpose()
}

/// Get a job by ID.
pub async fn get_on(conn: &mut PgConnection, id: JobId) -> Result<Job> {
    let row: Option<JobRow> = sqlx::query_as(
        "SELECT id, payload, dedup_key, status, worker_id, attempt_count, created_at, started_at, completed_at, last_error
         FROM jobs WHERE id = $1",
    )
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.ok_or(Error::NotFound(id))?.try_into_job()
}

/// List jobs, newest first.
pub async fn list_on(
    conn: &mut PgConnection,
    status: Option<Status>,
    limit: usize,
) -> Result<Vec<Job>> {
    let rows: Vec<JobRow> = sqlx::query_as(
        "SELECT id, payload, dedup_key, status, worker_id, attempt_count, created_at, started_at, completed_at, last_error
         FROM jobs
         WHERE ($1::text IS NULL OR status = $1)
         ORDER BY created_at DESC, id DESC
         LIMIT $2",
    )
    .bind(status.map(Status::as_str))
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(JobRow::try_into_job).collect()
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    status: String,
    worker_id: Option<String>,
    attempt_count: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    job: JobRow,
    inserted: bool,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            payload: self.payload,
            dedup_key: self.dedup_key,
            status: self.status.parse()?,
            worker_id: self.worker_id,
            attempt_count: u32::try_from(self.attempt_count)
                .map_err(|_| Error::Other(format!("negative attempt_count on job {}", self.id)))?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_error: self.last_error,
        })
    }
}

//! Postgres-backed job store.
//!
//! The single active-job slot is enforced by the `jobs_single_active` partial
//! unique index (see `pg::SCHEMA`); a violating insert surfaces as
//! [`JobStoreError::ActiveJobExists`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use lakepurge_core::{Identity, Job, JobConfig, JobId, JobStatus};

use super::store::{JobStore, JobStoreError};
use crate::page::Page;
use crate::pg::PgRuntime;

const ACTIVE_SLOT_INDEX: &str = "jobs_single_active";

pub struct PostgresJobStore {
    pg: Arc<PgRuntime>,
}

impl PostgresJobStore {
    pub fn new(pg: Arc<PgRuntime>) -> Self {
        Self { pg }
    }

    fn active_job_id(&self) -> Result<Option<JobId>, JobStoreError> {
        let pool = self.pg.pool();
        let id: Option<Uuid> = self
            .pg
            .block_on(
                sqlx::query_scalar(
                    "SELECT id FROM jobs WHERE status IN ('QUEUED', 'RUNNING', 'FORGET_COMPLETED') LIMIT 1",
                )
                .fetch_optional(pool),
            )
            .map_err(storage)?;
        Ok(id.map(JobId::from_uuid))
    }
}

fn storage(e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

fn corrupt(id: Uuid, what: &str, reason: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(format!("corrupt job {id}: {what}: {reason}"))
}

fn row_to_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let id: Uuid = row.try_get("id").map_err(storage)?;
    let raw_status: String = row.try_get("status").map_err(storage)?;
    let status = JobStatus::parse(&raw_status).ok_or_else(|| corrupt(id, "status", &raw_status))?;
    let config: JobConfig = serde_json::from_value(row.try_get("config").map_err(storage)?)
        .map_err(|e| corrupt(id, "config", e))?;
    let created_by: Identity = serde_json::from_value(row.try_get("created_by").map_err(storage)?)
        .map_err(|e| corrupt(id, "created_by", e))?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(storage)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(storage)?;
    let expires: Option<DateTime<Utc>> = row.try_get("expires").map_err(storage)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        status,
        created_at,
        updated_at,
        expires,
        config,
        created_by,
    })
}

fn is_active_slot_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation() && db.constraint() == Some(ACTIVE_SLOT_INDEX),
        _ => false,
    }
}

fn is_primary_key_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation() && db.constraint() == Some("jobs_pkey"),
        _ => false,
    }
}

impl JobStore for PostgresJobStore {
    fn insert_if_no_active(&self, job: &Job) -> Result<(), JobStoreError> {
        let pool = self.pg.pool();
        let config = serde_json::to_value(&job.config).map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let created_by =
            serde_json::to_value(&job.created_by).map_err(|e| JobStoreError::Storage(e.to_string()))?;

        let result = self.pg.block_on(
            sqlx::query(
                r#"
                INSERT INTO jobs (id, status, created_at, updated_at, expires, config, created_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.expires)
            .bind(config)
            .bind(created_by)
            .execute(pool),
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_active_slot_violation(&e) => {
                // Report the holder when we can still see it; it may have finished meanwhile.
                let holder = self.active_job_id()?.unwrap_or(job.id);
                Err(JobStoreError::ActiveJobExists(holder))
            }
            Err(e) if is_primary_key_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(storage(e)),
        }
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let pool = self.pg.pool();
        let row = self
            .pg
            .block_on(
                sqlx::query("SELECT * FROM jobs WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_optional(pool),
            )
            .map_err(storage)?;
        row.as_ref().map(row_to_job).transpose()
    }

    fn list(&self, limit: usize, start_after: Option<JobId>) -> Result<Page<Job, JobId>, JobStoreError> {
        let pool = self.pg.pool();
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let after: Option<Uuid> = start_after.map(Uuid::from);

        // An unknown cursor makes the row comparison NULL, so the page is empty.
        let rows = self
            .pg
            .block_on(
                sqlx::query(
                    r#"
                    SELECT * FROM jobs
                    WHERE $1::uuid IS NULL
                       OR (created_at, id) < (SELECT created_at, id FROM jobs WHERE id = $1)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(after)
                .bind(fetch)
                .fetch_all(pool),
            )
            .map_err(storage)?;

        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(jobs, limit, |job| job.id))
    }

    fn any_active(&self) -> Result<bool, JobStoreError> {
        Ok(self.active_job_id()?.is_some())
    }

    fn transition(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError> {
        let mut job = self.get(id)?.ok_or(JobStoreError::NotFound(id))?;
        let from = job.status;
        job.transition(next, Utc::now())
            .map_err(|_| JobStoreError::InvalidTransition { id, from, to: next })?;

        // Compare-and-set on the status we validated against.
        let pool = self.pg.pool();
        let result = self
            .pg
            .block_on(
                sqlx::query("UPDATE jobs SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4")
                    .bind(next.as_str())
                    .bind(job.updated_at)
                    .bind(id.as_uuid())
                    .bind(from.as_str())
                    .execute(pool),
            )
            .map_err(storage)?;

        if result.rows_affected() == 0 {
            // Someone else moved the job first; report against what is stored now.
            let current = self.get(id)?.ok_or(JobStoreError::NotFound(id))?;
            return Err(JobStoreError::InvalidTransition {
                id,
                from: current.status,
                to: next,
            });
        }
        Ok(job)
    }
}

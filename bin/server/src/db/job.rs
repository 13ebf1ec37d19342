//! Postgres-backed execution job queue.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so several workers can poll the same
//! table without handing one job to two of them.

use super::{parse_column, store_error};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dealflow_core::{ExecutionId, JobId, OrganizationId};
use dealflow_scheduler::{Job, JobQueue, QueueError};
use dealflow_workflow::StoreError;
use sqlx::{FromRow, PgPool};

/// Row type for job queries.
#[derive(FromRow)]
struct JobRow {
    id: String,
    organization_id: String,
    execution_id: String,
    visible_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    attempts: i32,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn try_into_record(self) -> Result<Job, sqlx::Error> {
        Ok(Job {
            id: parse_column(&self.id, "job id")?,
            organization_id: parse_column(&self.organization_id, "organization id")?,
            execution_id: parse_column(&self.execution_id, "execution id")?,
            visible_at: self.visible_at,
            leased_until: self.leased_until,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            created_at: self.created_at,
        })
    }
}

fn queue_error(error: sqlx::Error) -> QueueError {
    match store_error(error) {
        StoreError::Unavailable { reason } => QueueError::Unavailable { reason },
        other => QueueError::StorageFailed {
            reason: other.to_string(),
        },
    }
}

/// Job queue stored in the `execution_jobs` table.
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    /// Creates a new queue.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO execution_jobs
                (id, organization_id, execution_id, visible_at, leased_until, attempts, created_at)
            VALUES ($1, $2, $3, $4, NULL, 0, NOW())
            ON CONFLICT (execution_id) DO UPDATE
            SET visible_at = LEAST(execution_jobs.visible_at, EXCLUDED.visible_at)
            "#,
        )
        .bind(JobId::new().to_string())
        .bind(organization_id.to_string())
        .bind(execution_id.to_string())
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(())
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE execution_jobs
            SET leased_until = $3, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM execution_jobs
                WHERE visible_at <= $1 AND (leased_until IS NULL OR leased_until <= $1)
                ORDER BY visible_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, organization_id, execution_id, visible_at, leased_until,
                      attempts, created_at
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .bind(now + lease)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_error)?;

        let mut jobs = rows
            .into_iter()
            .map(JobRow::try_into_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(queue_error)?;
        jobs.sort_by_key(|job| job.visible_at);
        Ok(jobs)
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM execution_jobs WHERE id = $1")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound { id: job_id });
        }
        Ok(())
    }

    async fn reschedule(&self, job_id: JobId, visible_at: DateTime<Utc>) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE execution_jobs SET visible_at = $2, leased_until = NULL WHERE id = $1",
        )
        .bind(job_id.to_string())
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound { id: job_id });
        }
        Ok(())
    }
}

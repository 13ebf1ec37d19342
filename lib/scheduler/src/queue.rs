//! Job queue with delayed visibility.
//!
//! Each job asks a worker to advance one execution. A job is invisible until
//! its `visible_at` has passed; claiming a job leases it for a while so that a
//! crashed worker's jobs become visible again. There is at most one job per
//! execution, so an execution is never advanced by two workers at once.

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dealflow_core::{ExecutionId, JobId, OrganizationId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A queued unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub organization_id: OrganizationId,
    pub execution_id: ExecutionId,
    /// Workers ignore the job until this instant.
    pub visible_at: DateTime<Utc>,
    /// While set and in the future, the job is held by a worker.
    pub leased_until: Option<DateTime<Utc>>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a job for an execution, visible at `visible_at`.
    #[must_use]
    pub fn new(
        organization_id: OrganizationId,
        execution_id: ExecutionId,
        visible_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            organization_id,
            execution_id,
            visible_at,
            leased_until: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Returns true if a worker may claim the job at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now && self.leased_until.is_none_or(|until| until <= now)
    }
}

/// Durable queue of execution jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Schedules an execution to be advanced at `visible_at`.
    ///
    /// If the execution already has a job, its visibility moves to the earlier
    /// of the two instants and no second job is created.
    async fn enqueue(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Leases up to `limit` visible jobs for `lease`.
    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Job>, QueueError>;

    /// Removes a finished job.
    async fn complete(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Releases a job and makes it visible again at `visible_at`.
    async fn reschedule(&self, job_id: JobId, visible_at: DateTime<Utc>) -> Result<(), QueueError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A job queue held in memory.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every queued job.
    #[must_use]
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<_> = lock(&self.jobs).values().cloned().collect();
        jobs.sort_by_key(|job| (job.visible_at, job.id));
        jobs
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
        visible_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut jobs = lock(&self.jobs);
        if let Some(existing) = jobs
            .values_mut()
            .find(|job| job.execution_id == execution_id)
        {
            existing.visible_at = existing.visible_at.min(visible_at);
            return Ok(());
        }
        let job = Job::new(organization_id, execution_id, visible_at);
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        let mut jobs = lock(&self.jobs);
        let mut ready: Vec<_> = jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .map(|job| (job.visible_at, job.id))
            .collect();
        ready.sort();

        let mut claimed = Vec::new();
        for (_, id) in ready.into_iter().take(limit as usize) {
            if let Some(job) = jobs.get_mut(&id) {
                job.leased_until = Some(now + lease);
                job.attempts += 1;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        lock(&self.jobs)
            .remove(&job_id)
            .map(|_| ())
            .ok_or(QueueError::NotFound { id: job_id })
    }

    async fn reschedule(&self, job_id: JobId, visible_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound { id: job_id })?;
        job.visible_at = visible_at;
        job.leased_until = None;
        Ok(())
    }
}

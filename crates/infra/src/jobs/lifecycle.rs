//! Job lifecycle: the single active-job gate between the deletion queue and jobs.

use chrono::Utc;
use tracing::{info, instrument, warn};

use lakepurge_core::{
    Identity, Job, JobConfig, JobConfigOverrides, JobId, JobStatus, QueueItemId, ValidationError,
};

use super::store::{JobStore, JobStoreError};
use crate::deletion_queue::{checked_page_size, DeletionQueueStore, QueueStoreError};
use crate::page::Page;

const JOB_IN_PROGRESS: &str = "there is already a job in progress";
const QUEUE_LOCKED: &str = "cannot modify the deletion queue while a job is active";

/// Lifecycle error, shaped for callers that map onto request outcomes.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The request collides with the active job (or lack of a cancellable one).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job store error: {0}")]
    JobStore(JobStoreError),

    #[error("deletion queue error: {0}")]
    QueueStore(#[from] QueueStoreError),
}

impl From<JobStoreError> for LifecycleError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::ActiveJobExists(_) => LifecycleError::Conflict(JOB_IN_PROGRESS.to_string()),
            JobStoreError::NotFound(id) => LifecycleError::NotFound(id),
            JobStoreError::InvalidTransition { id, from, to } => {
                LifecycleError::Conflict(format!("job {id} cannot move from {from} to {to}"))
            }
            other => LifecycleError::JobStore(other),
        }
    }
}

/// Creates, lists and cancels jobs, and gates deletion-queue removals.
///
/// Queue removals are refused while any job is active, so a running job's
/// view of the queue does not shift under it.
pub struct JobLifecycleManager<J, Q> {
    jobs: J,
    queue: Q,
}

impl<J, Q> JobLifecycleManager<J, Q>
where
    J: JobStore,
    Q: DeletionQueueStore,
{
    pub fn new(jobs: J, queue: Q) -> Self {
        Self { jobs, queue }
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    pub fn exists_active(&self) -> Result<bool, LifecycleError> {
        Ok(self.jobs.any_active()?)
    }

    /// Create a QUEUED job with a snapshot of `defaults` merged with `overrides`.
    ///
    /// The insert is conditional on the active slot, so of two concurrent
    /// callers exactly one gets a job and the other a `Conflict`.
    #[instrument(skip_all, fields(user = %identity.username))]
    pub fn create(
        &self,
        defaults: &JobConfig,
        overrides: &JobConfigOverrides,
        identity: &Identity,
    ) -> Result<Job, LifecycleError> {
        let config = defaults.merged(overrides)?;
        let job = Job::new(config, identity.clone(), Utc::now());

        match self.jobs.insert_if_no_active(&job) {
            Ok(()) => {
                info!(job_id = %job.id, "job created");
                Ok(job)
            }
            Err(JobStoreError::ActiveJobExists(active)) => {
                warn!(active_job_id = %active, "job creation refused: another job is active");
                Err(LifecycleError::Conflict(JOB_IN_PROGRESS.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove items from the deletion queue. Refused while a job is active.
    pub fn cancel_queue_items(&self, ids: &[QueueItemId]) -> Result<usize, LifecycleError> {
        if self.jobs.any_active()? {
            return Err(LifecycleError::Conflict(QUEUE_LOCKED.to_string()));
        }
        let removed = self.queue.remove(ids)?;
        info!(requested = ids.len(), removed, "cancelled deletion queue items");
        Ok(removed)
    }

    pub fn get(&self, id: JobId) -> Result<Job, LifecycleError> {
        self.jobs.get(id)?.ok_or(LifecycleError::NotFound(id))
    }

    /// One page of jobs, newest first.
    pub fn list(
        &self,
        page_size: Option<usize>,
        start_after: Option<JobId>,
    ) -> Result<Page<Job, JobId>, LifecycleError> {
        let limit = checked_page_size(page_size)?;
        Ok(self.jobs.list(limit, start_after)?)
    }

    /// Cancel a job that has not started yet. Frees the active slot.
    pub fn cancel_job(&self, id: JobId) -> Result<Job, LifecycleError> {
        let job = self.get(id)?;
        if job.status != JobStatus::Queued {
            return Err(LifecycleError::Conflict(format!(
                "job {id} is {}; only QUEUED jobs can be cancelled",
                job.status
            )));
        }
        let cancelled = self.jobs.transition(id, JobStatus::Cancelled)?;
        info!(job_id = %id, "job cancelled");
        Ok(cancelled)
    }

    /// Record a status reported by the orchestrator.
    pub fn advance(&self, id: JobId, next: JobStatus) -> Result<Job, LifecycleError> {
        let job = self.jobs.transition(id, next)?;
        info!(job_id = %id, status = %next, "job status advanced");
        Ok(job)
    }
}

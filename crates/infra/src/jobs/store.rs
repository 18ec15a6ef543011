//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use lakepurge_core::{Job, JobId, JobStatus};

use crate::page::Page;

/// Job store abstraction.
///
/// Creation goes through [`JobStore::insert_if_no_active`], a conditional write
/// against the single active-job slot. A plain "check, then insert" would let
/// two concurrent creators both win.
pub trait JobStore: Send + Sync {
    /// Insert `job` only if no job currently holds the active slot.
    fn insert_if_no_active(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// List jobs newest first, resuming after the job `start_after`.
    fn list(&self, limit: usize, start_after: Option<JobId>) -> Result<Page<Job, JobId>, JobStoreError>;

    /// Whether any job is in an active status.
    fn any_active(&self) -> Result<bool, JobStoreError>;

    /// Atomically move a job to `next`, enforcing the status machine.
    ///
    /// Leaving an active status releases the active slot.
    fn transition(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job {0} is already active")]
    ActiveJobExists(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert_if_no_active(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert_if_no_active(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn list(&self, limit: usize, start_after: Option<JobId>) -> Result<Page<Job, JobId>, JobStoreError> {
        (**self).list(limit, start_after)
    }

    fn any_active(&self) -> Result<bool, JobStoreError> {
        (**self).any_active()
    }

    fn transition(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError> {
        (**self).transition(id, next)
    }
}

#[derive(Debug, Default)]
struct Jobs {
    by_id: HashMap<JobId, Job>,
    /// The job holding the active slot, if any.
    active_slot: Option<JobId>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Jobs>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("lock poisoned".to_string())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_if_no_active(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.inner.write().map_err(|_| Self::poisoned())?;
        if let Some(active) = jobs.active_slot {
            return Err(JobStoreError::ActiveJobExists(active));
        }
        if jobs.by_id.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        if job.is_active() {
            jobs.active_slot = Some(job.id);
        }
        jobs.by_id.insert(job.id, job.clone());
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.by_id.get(&id).cloned())
    }

    fn list(&self, limit: usize, start_after: Option<JobId>) -> Result<Page<Job, JobId>, JobStoreError> {
        let jobs = self.inner.read().map_err(|_| Self::poisoned())?;

        let mut all: Vec<&Job> = jobs.by_id.values().collect();
        all.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let start = match start_after {
            None => 0,
            Some(cursor) => match all.iter().position(|j| j.id == cursor) {
                Some(pos) => pos + 1,
                // Unknown cursor: nothing sorts after it.
                None => all.len(),
            },
        };

        let rows: Vec<Job> = all
            .into_iter()
            .skip(start)
            .take(limit.saturating_add(1))
            .cloned()
            .collect();
        Ok(Page::from_overfetch(rows, limit, |job| job.id))
    }

    fn any_active(&self) -> Result<bool, JobStoreError> {
        let jobs = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.active_slot.is_some())
    }

    fn transition(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError> {
        let mut guard = self.inner.write().map_err(|_| Self::poisoned())?;
        let jobs = &mut *guard;

        let job = jobs.by_id.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let from = job.status;
        job.transition(next, Utc::now())
            .map_err(|_| JobStoreError::InvalidTransition { id, from, to: next })?;

        if next.is_terminal() && jobs.active_slot == Some(id) {
            jobs.active_slot = None;
        }
        Ok(job.clone())
    }
}

#[cfg(test)]
mod tests {
    use lakepurge_core::{Identity, JobConfig};

    use super::*;

    fn new_job() -> Job {
        let config = JobConfig {
            concurrency_limit: 20,
            max_parallel_deletion_tasks: 3,
            query_execution_wait_seconds: 3,
            query_queue_wait_seconds: 3,
            forget_queue_wait_seconds: 30,
            job_details_retention_days: None,
        };
        Job::new(config, Identity::new("u", "s"), Utc::now())
    }

    #[test]
    fn second_active_job_is_refused() {
        let store = InMemoryJobStore::new();
        let first = new_job();
        store.insert_if_no_active(&first).unwrap();

        let err = store.insert_if_no_active(&new_job()).unwrap_err();
        assert!(matches!(err, JobStoreError::ActiveJobExists(id) if id == first.id));
        assert!(store.any_active().unwrap());
    }

    #[test]
    fn terminal_transition_frees_the_slot() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_if_no_active(&job).unwrap();

        store.transition(job.id, JobStatus::Running).unwrap();
        assert!(store.any_active().unwrap());
        store.transition(job.id, JobStatus::ForgetCompleted).unwrap();
        assert!(store.any_active().unwrap());
        let done = store.transition(job.id, JobStatus::Completed).unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert!(!store.any_active().unwrap());
        store.insert_if_no_active(&new_job()).unwrap();
    }

    #[test]
    fn illegal_transition_leaves_job_untouched() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        store.insert_if_no_active(&job).unwrap();

        let err = store.transition(job.id, JobStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::InvalidTransition { from: JobStatus::Queued, to: JobStatus::Completed, .. }
        ));
        assert_eq!(store.get(job.id).unwrap().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn list_is_newest_first_and_paginates() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = new_job();
            store.insert_if_no_active(&job).unwrap();
            store.transition(job.id, JobStatus::Cancelled).unwrap();
            ids.push(job.id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let first = store.list(2, None).unwrap();
        let listed: Vec<_> = first.items.iter().map(|j| j.id).collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);
        assert_eq!(first.next_start, Some(ids[1]));

        let rest = store.list(2, first.next_start).unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].id, ids[0]);
        assert_eq!(rest.next_start, None);
    }

    #[test]
    fn unknown_job_transition_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert!(matches!(store.transition(id, JobStatus::Running), Err(JobStoreError::NotFound(found)) if found == id));
    }
}

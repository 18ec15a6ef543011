//! Purge jobs: status machine and the configuration snapshot taken at creation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, ValidationError};
use crate::id::JobId;
use crate::identity::Identity;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, waiting for the orchestrator to pick it up
    Queued,
    /// Find/forget phases in progress
    Running,
    /// Forget phase finished; cleanup still in progress
    ForgetCompleted,
    ForgetPartiallyFailed,
    ForgetFailed,
    Completed,
    CompletedCleanupFailed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::ForgetCompleted,
        JobStatus::ForgetPartiallyFailed,
        JobStatus::ForgetFailed,
        JobStatus::Completed,
        JobStatus::CompletedCleanupFailed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Statuses that occupy the single active-job slot.
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Queued, JobStatus::Running, JobStatus::ForgetCompleted];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::ForgetCompleted => "FORGET_COMPLETED",
            JobStatus::ForgetPartiallyFailed => "FORGET_PARTIALLY_FAILED",
            JobStatus::ForgetFailed => "FORGET_FAILED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::CompletedCleanupFailed => "COMPLETED_CLEANUP_FAILED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Queued => matches!(next, Running | Cancelled | Failed),
            Running => matches!(
                next,
                ForgetCompleted
                    | ForgetPartiallyFailed
                    | ForgetFailed
                    | Completed
                    | CompletedCleanupFailed
                    | Failed
            ),
            ForgetCompleted => matches!(next, Completed | CompletedCleanupFailed | Failed),
            _ => false,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings a job runs with, copied by value when the job is created.
///
/// A later change to the operator's settings never alters a job already in
/// flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Ceiling on concurrently admitted query executions.
    #[serde(rename = "AthenaConcurrencyLimit")]
    pub concurrency_limit: u32,
    #[serde(rename = "DeletionTasksMaxNumber")]
    pub max_parallel_deletion_tasks: u32,
    #[serde(rename = "QueryExecutionWaitSeconds")]
    pub query_execution_wait_seconds: u32,
    #[serde(rename = "QueryQueueWaitSeconds")]
    pub query_queue_wait_seconds: u32,
    #[serde(rename = "ForgetQueueWaitSeconds")]
    pub forget_queue_wait_seconds: u32,
    #[serde(rename = "JobDetailsRetentionDays", default, skip_serializing_if = "Option::is_none")]
    pub job_details_retention_days: Option<u32>,
}

impl JobConfig {
    /// Apply per-job overrides on top of these settings.
    pub fn merged(&self, overrides: &JobConfigOverrides) -> Result<JobConfig, ValidationError> {
        let merged = JobConfig {
            concurrency_limit: overrides.concurrency_limit.unwrap_or(self.concurrency_limit),
            max_parallel_deletion_tasks: overrides
                .max_parallel_deletion_tasks
                .unwrap_or(self.max_parallel_deletion_tasks),
            query_execution_wait_seconds: overrides
                .query_execution_wait_seconds
                .unwrap_or(self.query_execution_wait_seconds),
            query_queue_wait_seconds: overrides
                .query_queue_wait_seconds
                .unwrap_or(self.query_queue_wait_seconds),
            forget_queue_wait_seconds: overrides
                .forget_queue_wait_seconds
                .unwrap_or(self.forget_queue_wait_seconds),
            job_details_retention_days: overrides
                .job_details_retention_days
                .or(self.job_details_retention_days),
        };
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency_limit == 0 {
            return Err(ValidationError::InvalidOverride {
                field: "AthenaConcurrencyLimit",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_parallel_deletion_tasks == 0 {
            return Err(ValidationError::InvalidOverride {
                field: "DeletionTasksMaxNumber",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Retention window, if one is configured and non-zero.
    pub fn retention(&self) -> Option<Duration> {
        self.job_details_retention_days
            .filter(|days| *days > 0)
            .map(|days| Duration::days(i64::from(days)))
    }
}

/// Per-job overrides of the operator defaults. `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfigOverrides {
    #[serde(rename = "AthenaConcurrencyLimit", default)]
    pub concurrency_limit: Option<u32>,
    #[serde(rename = "DeletionTasksMaxNumber", default)]
    pub max_parallel_deletion_tasks: Option<u32>,
    #[serde(rename = "QueryExecutionWaitSeconds", default)]
    pub query_execution_wait_seconds: Option<u32>,
    #[serde(rename = "QueryQueueWaitSeconds", default)]
    pub query_queue_wait_seconds: Option<u32>,
    #[serde(rename = "ForgetQueueWaitSeconds", default)]
    pub forget_queue_wait_seconds: Option<u32>,
    #[serde(rename = "JobDetailsRetentionDays", default)]
    pub job_details_retention_days: Option<u32>,
}

/// A purge job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "JobStatus")]
    pub status: JobStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub config: JobConfig,
    pub created_by: Identity,
}

impl Job {
    /// Create a queued job with a snapshot of `config`.
    pub fn new(config: JobConfig, created_by: Identity, now: DateTime<Utc>) -> Self {
        let expires = config.retention().map(|window| now + window);
        Self {
            id: JobId::new(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            expires,
            config,
            created_by,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Move to `next`, enforcing the status machine.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

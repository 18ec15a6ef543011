//! `lakepurge-core`: domain building blocks for the purge pipeline.
//!
//! This crate contains **pure domain** types and rules (no infrastructure
//! concerns): identifiers, queue items and their validation, the job status
//! machine, and the dispatcher's admission quota.

pub mod capacity;
pub mod error;
pub mod id;
pub mod identity;
pub mod job;
pub mod queue_item;

pub use capacity::{checked_quota, counter, quota, CapacityError, QueueVisibility};
pub use error::{DomainError, DomainResult, ValidationError};
pub use id::{ExecutionId, JobId, QueueItemId};
pub use identity::Identity;
pub use job::{Job, JobConfig, JobConfigOverrides, JobStatus};
pub use queue_item::{
    validate_queue_items, DeletionQueueItem, MatchColumn, MatchId, MatchKind, NewQueueItem,
};

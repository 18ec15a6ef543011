//! Purge job persistence and lifecycle.
//!
//! ## Components
//!
//! - `JobStore`: persistence with a conditional insert on the active-job slot
//! - `JobLifecycleManager`: create/cancel/list jobs and gate deletion-queue removals
//!
//! At most one job holds an active status (QUEUED, RUNNING, FORGET_COMPLETED)
//! at any time. Both store backends enforce this atomically.

pub mod lifecycle;
pub mod postgres;
pub mod store;

pub use lifecycle::{JobLifecycleManager, LifecycleError};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};

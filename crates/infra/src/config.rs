//! Operator settings: job defaults plus dispatcher tuning.
//!
//! Settings use the same PascalCase names whether they come from a JSON
//! settings document or from environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use lakepurge_core::JobConfig;

use crate::dispatcher::MalformedMessagePolicy;

pub const DEFAULT_CONCURRENCY_LIMIT: u32 = 20;
pub const DEFAULT_DELETION_TASKS_MAX: u32 = 3;
pub const DEFAULT_QUERY_EXECUTION_WAIT_SECONDS: u32 = 3;
pub const DEFAULT_QUERY_QUEUE_WAIT_SECONDS: u32 = 3;
pub const DEFAULT_FORGET_QUEUE_WAIT_SECONDS: u32 = 30;

/// Upper bound a single receive call may return (SQS-style batch cap).
pub const DEFAULT_RECEIVE_BATCH_SIZE: u32 = 10;
pub const DEFAULT_RECEIVE_WAIT_SECONDS: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("malformed settings document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Full operator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Defaults snapshotted into every new job.
    #[serde(flatten)]
    pub job_defaults: JobConfig,
    #[serde(flatten)]
    pub dispatcher: DispatcherSettings,
}

/// How the dispatcher talks to the pending-work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatcherSettings {
    #[serde(default = "default_receive_wait_seconds")]
    pub receive_wait_seconds: u32,
    #[serde(default = "default_receive_batch_size")]
    pub receive_batch_size: u32,
    #[serde(default)]
    pub malformed_message_policy: MalformedMessagePolicy,
}

fn default_receive_wait_seconds() -> u32 {
    DEFAULT_RECEIVE_WAIT_SECONDS
}

fn default_receive_batch_size() -> u32 {
    DEFAULT_RECEIVE_BATCH_SIZE
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            receive_wait_seconds: DEFAULT_RECEIVE_WAIT_SECONDS,
            receive_batch_size: DEFAULT_RECEIVE_BATCH_SIZE,
            malformed_message_policy: MalformedMessagePolicy::default(),
        }
    }
}

impl DispatcherSettings {
    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(u64::from(self.receive_wait_seconds))
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            job_defaults: JobConfig {
                concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
                max_parallel_deletion_tasks: DEFAULT_DELETION_TASKS_MAX,
                query_execution_wait_seconds: DEFAULT_QUERY_EXECUTION_WAIT_SECONDS,
                query_queue_wait_seconds: DEFAULT_QUERY_QUEUE_WAIT_SECONDS,
                forget_queue_wait_seconds: DEFAULT_FORGET_QUEUE_WAIT_SECONDS,
                job_details_retention_days: None,
            },
            dispatcher: DispatcherSettings::default(),
        }
    }
}

impl PurgeConfig {
    /// Parse a JSON settings document.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: PurgeConfig = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from process environment, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (environment, parameter store, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = PurgeConfig::default();
        let jobs = &mut config.job_defaults;

        read_u32(&lookup, "AthenaConcurrencyLimit", &mut jobs.concurrency_limit)?;
        read_u32(&lookup, "DeletionTasksMaxNumber", &mut jobs.max_parallel_deletion_tasks)?;
        read_u32(&lookup, "QueryExecutionWaitSeconds", &mut jobs.query_execution_wait_seconds)?;
        read_u32(&lookup, "QueryQueueWaitSeconds", &mut jobs.query_queue_wait_seconds)?;
        read_u32(&lookup, "ForgetQueueWaitSeconds", &mut jobs.forget_queue_wait_seconds)?;
        if let Some(raw) = lookup("JobDetailsRetentionDays") {
            jobs.job_details_retention_days = Some(parse_u32("JobDetailsRetentionDays", &raw)?);
        }

        let dispatcher = &mut config.dispatcher;
        read_u32(&lookup, "ReceiveWaitSeconds", &mut dispatcher.receive_wait_seconds)?;
        read_u32(&lookup, "ReceiveBatchSize", &mut dispatcher.receive_batch_size)?;
        if let Some(raw) = lookup("MalformedMessagePolicy") {
            dispatcher.malformed_message_policy =
                raw.parse().map_err(|reason: String| ConfigError::Invalid {
                    key: "MalformedMessagePolicy",
                    value: raw.clone(),
                    reason,
                })?;
        }

        config.validate()?;
        debug!(?config, "loaded purge settings");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.job_defaults
            .validate()
            .map_err(|e| ConfigError::Invalid {
                key: "JobDefaults",
                value: format!("{:?}", self.job_defaults),
                reason: e.to_string(),
            })?;
        if self.dispatcher.receive_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "ReceiveBatchSize",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn read_u32(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut u32,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *target = parse_u32(key, &raw)?;
    }
    Ok(())
}

fn parse_u32(key: &'static str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

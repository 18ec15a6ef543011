//! Work queue dispatcher: turns an orchestrator tick into launched execution units.
//!
//! ## Flow
//!
//! 1. Compute the admission quota from the concurrency limit and queue counters
//! 2. Receive up to `quota` messages, in batches of `receive_batch_size`
//! 3. Enrich each body with job/execution/receipt correlation fields
//! 4. Launch one execution unit per message
//!
//! Messages are never deleted here. Each execution unit acknowledges its own
//! delivery, so a crashed unit's message is redelivered by the queue.

pub mod launcher;
pub mod payload;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, instrument, warn};

use lakepurge_core::{counter, quota, CapacityError, DomainError, ExecutionId, Job, JobId, QueueVisibility};

use crate::config::DispatcherSettings;
use crate::jobs::{JobStore, JobStoreError};
use crate::work_queue::{ReceiptHandle, WorkQueue, WorkQueueError, WorkQueueMessage};

pub use launcher::{ExecutionLauncher, LaunchError, RecordingLauncher, TaskHandler, TaskOutcome, ThreadLauncher};
pub use payload::{fingerprint, PayloadError, TaskPayload};

/// What to do with a message whose body is not a JSON object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MalformedMessagePolicy {
    /// Abort the tick. Units launched before the bad message stay launched.
    #[default]
    FailTick,
    /// Move the message to the dead-letter store and keep going.
    DeadLetter,
}

impl core::str::FromStr for MalformedMessagePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "FailTick" => Ok(Self::FailTick),
            "DeadLetter" => Ok(Self::DeadLetter),
            other => Err(format!("expected FailTick or DeadLetter, got {other:?}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Queue(#[from] WorkQueueError),

    #[error("invalid tick event: {0}")]
    InvalidEvent(String),

    #[error("tick names unknown job {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    JobStore(#[from] JobStoreError),

    #[error("malformed message {receipt_handle} after {launched} launches: {source}")]
    MessageParse {
        receipt_handle: ReceiptHandle,
        launched: u32,
        #[source]
        source: PayloadError,
    },
}

/// A message that failed to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchFailure {
    pub receipt_handle: ReceiptHandle,
    pub error: String,
}

/// A malformed message moved to the dead-letter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RejectedMessage {
    pub receipt_handle: ReceiptHandle,
    pub reason: String,
}

/// Summary of one dispatch tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatchReport {
    pub quota: u32,
    pub received: u32,
    pub launched: u32,
    pub launch_failures: Vec<LaunchFailure>,
    pub rejected: Vec<RejectedMessage>,
}

impl DispatchReport {
    fn idle(quota: u32) -> Self {
        Self {
            quota,
            ..Self::default()
        }
    }
}

/// The orchestrator's per-tick event.
///
/// Counters arrive either as numbers or as numeric strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TickEvent {
    pub execution_id: ExecutionId,
    /// The job id; the orchestrator names each execution after its job.
    pub execution_name: String,
    pub query_queue: QueueCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueCounters {
    #[serde(deserialize_with = "lenient_i64")]
    pub visible: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub not_visible: i64,
}

impl TickEvent {
    pub fn job_id(&self) -> Result<JobId, DomainError> {
        self.execution_name.parse()
    }

    /// Queue counters, rejecting negative or oversized values.
    pub fn visibility(&self) -> Result<QueueVisibility, CapacityError> {
        Ok(QueueVisibility::new(
            counter("visible", self.query_queue.visible)?,
            counter("not_visible", self.query_queue.not_visible)?,
        ))
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Stateless between calls; safe to share across threads.
pub struct WorkQueueDispatcher<Q, L> {
    queue: Q,
    launcher: L,
    settings: DispatcherSettings,
}

impl<Q, L> WorkQueueDispatcher<Q, L>
where
    Q: WorkQueue,
    L: ExecutionLauncher,
{
    pub fn new(queue: Q, launcher: L, settings: DispatcherSettings) -> Self {
        Self {
            queue,
            launcher,
            settings,
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run one tick against the job's own concurrency snapshot.
    pub fn dispatch_for_job(
        &self,
        job: &Job,
        execution_id: &ExecutionId,
        visibility: QueueVisibility,
    ) -> Result<DispatchReport, DispatchError> {
        self.dispatch(job.id, execution_id, job.config.concurrency_limit, visibility)
    }

    /// Run one tick from an orchestrator event.
    ///
    /// The limit is the concurrency snapshot of the job the event names, so
    /// per-job overrides hold and later operator changes do not reach a job
    /// already in flight. A job that is no longer active gets an idle tick.
    /// Counters and the job id are validated before the queue is touched.
    pub fn dispatch_tick<J: JobStore>(&self, event: &TickEvent, jobs: &J) -> Result<DispatchReport, DispatchError> {
        let visibility = event.visibility()?;
        let job_id = event
            .job_id()
            .map_err(|e| DispatchError::InvalidEvent(format!("ExecutionName: {e}")))?;
        let job = jobs.get(job_id)?.ok_or(DispatchError::UnknownJob(job_id))?;

        if !job.is_active() {
            info!(job_id = %job_id, status = %job.status, "job is not active; skipping tick");
            return Ok(DispatchReport::default());
        }
        self.dispatch_for_job(&job, &event.execution_id, visibility)
    }

    #[instrument(
        skip_all,
        fields(
            job_id = %job_id,
            limit = limit,
            execution_id = %execution_id,
            visible = visibility.visible,
            not_visible = visibility.not_visible
        )
    )]
    pub fn dispatch(
        &self,
        job_id: JobId,
        execution_id: &ExecutionId,
        limit: u32,
        visibility: QueueVisibility,
    ) -> Result<DispatchReport, DispatchError> {
        let quota = quota(limit, visibility);
        if quota == 0 {
            debug!(limit, "no capacity this tick");
            return Ok(DispatchReport::idle(0));
        }

        let mut report = DispatchReport::idle(quota);
        let messages = self.receive_up_to(quota)?;
        report.received = u32::try_from(messages.len()).unwrap_or(u32::MAX);

        for message in messages {
            let payload = match TaskPayload::from_message(&message, job_id, execution_id) {
                Ok(payload) => payload,
                Err(source) => {
                    self.reject(&mut report, message.receipt_handle, source)?;
                    continue;
                }
            };

            match self.launcher.launch(&payload) {
                Ok(()) => report.launched += 1,
                Err(e) => {
                    warn!(receipt_handle = %message.receipt_handle, error = %e, "failed to launch execution unit");
                    report.launch_failures.push(LaunchFailure {
                        receipt_handle: message.receipt_handle,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            quota,
            received = report.received,
            launched = report.launched,
            launch_failures = report.launch_failures.len(),
            rejected = report.rejected.len(),
            "dispatch tick finished"
        );
        Ok(report)
    }

    /// Receive in queue-sized batches until `quota` messages arrived or the queue runs dry.
    fn receive_up_to(&self, quota: u32) -> Result<Vec<WorkQueueMessage>, DispatchError> {
        let wanted = quota as usize;
        let batch_size = (self.settings.receive_batch_size.max(1)) as usize;
        let wait = self.settings.receive_wait();

        let mut received = Vec::with_capacity(wanted);
        while received.len() < wanted {
            let ask = batch_size.min(wanted - received.len());
            let batch = self.queue.receive(ask, wait)?;
            if batch.is_empty() {
                break;
            }
            received.extend(batch);
        }
        Ok(received)
    }

    fn reject(
        &self,
        report: &mut DispatchReport,
        receipt_handle: ReceiptHandle,
        source: PayloadError,
    ) -> Result<(), DispatchError> {
        match self.settings.malformed_message_policy {
            MalformedMessagePolicy::FailTick => Err(DispatchError::MessageParse {
                receipt_handle,
                launched: report.launched,
                source,
            }),
            MalformedMessagePolicy::DeadLetter => {
                let reason = source.to_string();
                warn!(receipt_handle = %receipt_handle, reason = %reason, "dead-lettering malformed message");
                self.queue.dead_letter(&receipt_handle, &reason)?;
                report.rejected.push(RejectedMessage { receipt_handle, reason });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use chrono::Utc;
    use lakepurge_core::{Identity, JobStatus};

    use super::*;
    use crate::config::PurgeConfig;
    use crate::jobs::InMemoryJobStore;
    use crate::work_queue::InMemoryWorkQueue;

    type TestDispatcher = WorkQueueDispatcher<Arc<InMemoryWorkQueue>, Arc<RecordingLauncher>>;

    fn settings(policy: MalformedMessagePolicy) -> DispatcherSettings {
        DispatcherSettings {
            receive_wait_seconds: 0,
            receive_batch_size: 10,
            malformed_message_policy: policy,
        }
    }

    fn dispatcher_with(launcher: RecordingLauncher, policy: MalformedMessagePolicy) -> TestDispatcher {
        WorkQueueDispatcher::new(Arc::new(InMemoryWorkQueue::new()), Arc::new(launcher), settings(policy))
    }

    fn dispatcher() -> TestDispatcher {
        dispatcher_with(RecordingLauncher::new(), MalformedMessagePolicy::FailTick)
    }

    fn fill(queue: &InMemoryWorkQueue, n: usize) {
        for i in 0..n {
            queue.send(&json!({ "QueryId": format!("q{i}") }).to_string()).unwrap();
        }
    }

    /// A store holding one queued job whose snapshot limit is `limit`.
    fn store_with_job(limit: u32) -> (Arc<InMemoryJobStore>, Job) {
        let mut config = PurgeConfig::default().job_defaults;
        config.concurrency_limit = limit;
        let job = Job::new(config, Identity::new("user", "sub"), Utc::now());
        let store = InMemoryJobStore::arc();
        store.insert_if_no_active(&job).unwrap();
        (store, job)
    }

    fn tick_event(job_id: JobId, counters: serde_json::Value) -> TickEvent {
        serde_json::from_value(json!({
            "ExecutionId": "arn:exec:1",
            "ExecutionName": job_id.to_string(),
            "QueryQueue": counters
        }))
        .unwrap()
    }

    fn tick(d: &TestDispatcher, limit: u32) -> Result<DispatchReport, DispatchError> {
        let visibility = d.queue().visibility().unwrap();
        d.dispatch(JobId::new(), &ExecutionId::new("exec-1"), limit, visibility)
    }

    #[test]
    fn launches_up_to_the_quota_and_leaves_messages_queued() {
        let d = dispatcher();
        fill(d.queue(), 30);
        let job_id = JobId::new();
        let execution = ExecutionId::new("exec-1");

        let report = d
            .dispatch(job_id, &execution, 20, d.queue().visibility().unwrap())
            .unwrap();

        assert_eq!(report.quota, 20);
        assert_eq!(report.received, 20);
        assert_eq!(report.launched, 20);

        let launched = d.launcher().launched();
        assert_eq!(launched.len(), 20);
        let handles: HashSet<ReceiptHandle> = launched.iter().filter_map(TaskPayload::receipt_handle).collect();
        assert_eq!(handles.len(), 20);
        for payload in &launched {
            assert_eq!(payload.job_id(), Some(job_id.to_string().as_str()));
            assert_eq!(payload.get("ExecutionId"), Some(&json!("exec-1")));
        }

        // Received but unacknowledged messages stay on the queue.
        assert_eq!(d.queue().visibility().unwrap(), QueueVisibility::new(10, 20));
    }

    #[test]
    fn in_flight_messages_consume_capacity() {
        let d = dispatcher();
        fill(d.queue(), 30);
        tick(&d, 5).unwrap();

        let report = tick(&d, 20).unwrap();
        assert_eq!(report.quota, 15);
        assert_eq!(report.launched, 15);
    }

    #[test]
    fn no_capacity_means_no_receive() {
        let d = dispatcher();
        fill(d.queue(), 10);

        let report = d
            .dispatch(JobId::new(), &ExecutionId::new("exec"), 20, QueueVisibility::new(10, 25))
            .unwrap();

        assert_eq!(report, DispatchReport::default());
        assert_eq!(d.queue().visibility().unwrap(), QueueVisibility::new(10, 0));
    }

    #[test]
    fn fewer_messages_than_quota_is_not_an_error() {
        let d = dispatcher();
        fill(d.queue(), 3);

        let report = d
            .dispatch(JobId::new(), &ExecutionId::new("exec"), 20, QueueVisibility::new(8, 0))
            .unwrap();
        assert_eq!(report.quota, 8);
        assert_eq!(report.received, 3);
        assert_eq!(report.launched, 3);
    }

    #[test]
    fn payloads_carry_job_execution_and_receipt() {
        let d = dispatcher();
        fill(d.queue(), 1);
        let job_id = JobId::new();

        d.dispatch(job_id, &ExecutionId::new("exec-9"), 5, d.queue().visibility().unwrap())
            .unwrap();

        let launched = d.launcher().launched();
        let payload = &launched[0];
        assert_eq!(payload.get("QueryId"), Some(&json!("q0")));
        assert_eq!(payload.job_id(), Some(job_id.to_string().as_str()));
        assert_eq!(payload.get("ExecutionId"), Some(&json!("exec-9")));

        // The unit can acknowledge with the handle it was given.
        let handle = payload.receipt_handle().unwrap();
        d.queue().acknowledge(&handle).unwrap();
        assert!(d.queue().is_empty().unwrap());
    }

    #[test]
    fn malformed_message_fails_the_tick_after_earlier_launches() {
        let d = dispatcher();
        fill(d.queue(), 2);
        d.queue().send("not json").unwrap();
        fill(d.queue(), 1);

        let err = tick(&d, 10).unwrap_err();
        match err {
            DispatchError::MessageParse { launched, .. } => assert_eq!(launched, 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(d.launcher().launched().len(), 2);
    }

    #[test]
    fn dead_letter_policy_skips_malformed_messages() {
        let d = dispatcher_with(RecordingLauncher::new(), MalformedMessagePolicy::DeadLetter);
        fill(d.queue(), 1);
        d.queue().send("[1,2,3]").unwrap();
        fill(d.queue(), 1);

        let report = tick(&d, 10).unwrap();

        assert_eq!(report.received, 3);
        assert_eq!(report.launched, 2);
        assert_eq!(report.rejected.len(), 1);
        let dead = d.queue().dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].receipt_handle, report.rejected[0].receipt_handle);
    }

    #[test]
    fn launch_failure_does_not_abort_siblings() {
        let launcher = RecordingLauncher::failing_when(|p| p.get("QueryId") == Some(&json!("q1")));
        let d = dispatcher_with(launcher, MalformedMessagePolicy::FailTick);
        fill(d.queue(), 3);

        let report = tick(&d, 10).unwrap();

        assert_eq!(report.received, 3);
        assert_eq!(report.launched, 2);
        assert_eq!(report.launch_failures.len(), 1);
        assert_eq!(d.launcher().launched().len(), 2);
    }

    #[test]
    fn receives_in_batches_until_quota() {
        let d = WorkQueueDispatcher::new(
            Arc::new(InMemoryWorkQueue::new()),
            Arc::new(RecordingLauncher::new()),
            DispatcherSettings {
                receive_batch_size: 3,
                ..settings(MalformedMessagePolicy::FailTick)
            },
        );
        fill(d.queue(), 12);

        let report = tick(&d, 8).unwrap();
        assert_eq!(report.received, 8);
        assert_eq!(report.launched, 8);
    }

    #[test]
    fn redelivered_message_keeps_its_fingerprint() {
        let queue = Arc::new(InMemoryWorkQueue::with_visibility_timeout(Duration::from_millis(10)));
        let d = WorkQueueDispatcher::new(
            queue.clone(),
            Arc::new(RecordingLauncher::new()),
            settings(MalformedMessagePolicy::FailTick),
        );
        fill(&queue, 1);

        tick(&d, 1).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        tick(&d, 1).unwrap();

        let launched = d.launcher().launched();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[0].fingerprint(), launched[1].fingerprint());
        assert_ne!(launched[0].receipt_handle(), launched[1].receipt_handle());
    }

    #[test]
    fn tick_event_accepts_string_counters() {
        let d = dispatcher();
        fill(d.queue(), 4);
        let (jobs, job) = store_with_job(3);
        let event = tick_event(job.id, json!({ "Visible": "4", "NotVisible": 1 }));

        let report = d.dispatch_tick(&event, &jobs).unwrap();
        assert_eq!(report.quota, 2);
        assert_eq!(report.launched, 2);
        assert_eq!(d.launcher().launched()[0].job_id(), Some(job.id.to_string().as_str()));
    }

    #[test]
    fn tick_uses_the_job_snapshot_not_the_operator_default() {
        let d = dispatcher();
        fill(d.queue(), 10);
        let (jobs, job) = store_with_job(2);
        assert_eq!(PurgeConfig::default().job_defaults.concurrency_limit, 20);

        let first = d
            .dispatch_tick(&tick_event(job.id, json!({ "Visible": 10, "NotVisible": 0 })), &jobs)
            .unwrap();
        assert_eq!(first.quota, 2);
        assert_eq!(first.launched, 2);

        // The two deliveries are still in flight.
        let second = d
            .dispatch_tick(&tick_event(job.id, json!({ "Visible": 8, "NotVisible": 2 })), &jobs)
            .unwrap();
        assert_eq!(second.launched, 0);
        assert_eq!(d.launcher().launched().len(), 2);
    }

    #[test]
    fn tick_for_an_unknown_job_is_rejected_before_receiving() {
        let d = dispatcher();
        fill(d.queue(), 1);
        let (jobs, _) = store_with_job(5);
        let stranger = JobId::new();

        let err = d
            .dispatch_tick(&tick_event(stranger, json!({ "Visible": 1, "NotVisible": 0 })), &jobs)
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownJob(id) if id == stranger));
        assert_eq!(d.queue().visibility().unwrap(), QueueVisibility::new(1, 0));
    }

    #[test]
    fn tick_for_a_finished_job_is_idle() {
        let d = dispatcher();
        fill(d.queue(), 3);
        let (jobs, job) = store_with_job(5);
        jobs.transition(job.id, JobStatus::Cancelled).unwrap();

        let report = d
            .dispatch_tick(&tick_event(job.id, json!({ "Visible": 3, "NotVisible": 0 })), &jobs)
            .unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(d.launcher().launched().is_empty());
    }

    #[test]
    fn tick_event_with_negative_counter_is_rejected() {
        let d = dispatcher();
        let (jobs, job) = store_with_job(20);
        let event = tick_event(job.id, json!({ "Visible": 5, "NotVisible": "-2" }));

        let err = d.dispatch_tick(&event, &jobs).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Capacity(CapacityError::Negative { field: "not_visible", value: -2 })
        ));
    }

    #[test]
    fn tick_event_must_name_a_job() {
        let d = dispatcher();
        fill(d.queue(), 1);
        let (jobs, _) = store_with_job(20);
        let event: TickEvent = serde_json::from_value(json!({
            "ExecutionId": "exec",
            "ExecutionName": "not-a-job",
            "QueryQueue": { "Visible": 1, "NotVisible": 0 }
        }))
        .unwrap();

        assert!(matches!(d.dispatch_tick(&event, &jobs), Err(DispatchError::InvalidEvent(_))));
        assert_eq!(d.queue().visibility().unwrap(), QueueVisibility::new(1, 0));
    }

    #[test]
    fn policy_parses_from_its_name() {
        assert_eq!("DeadLetter".parse(), Ok(MalformedMessagePolicy::DeadLetter));
        assert_eq!("FailTick".parse(), Ok(MalformedMessagePolicy::FailTick));
        assert!("Ignore".parse::<MalformedMessagePolicy>().is_err());
    }
}

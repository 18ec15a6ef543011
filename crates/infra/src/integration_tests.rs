//! Integration tests for a full purge cycle.
//!
//! Tests: enqueue → create job → orchestrator ticks → execution units ack → job completes
//!
//! Verifies:
//! - The deletion queue is frozen while the job is active
//! - Dispatch never exceeds the job's concurrency snapshot
//! - Acknowledged work frees capacity for the next tick

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use lakepurge_core::{ExecutionId, Identity, JobConfigOverrides, JobStatus, NewQueueItem};

    use crate::config::PurgeConfig;
    use crate::deletion_queue::{DeletionQueue, InMemoryDeletionQueueStore};
    use crate::dispatcher::{
        DispatchReport, RecordingLauncher, TaskPayload, ThreadLauncher, TickEvent, WorkQueueDispatcher,
    };
    use crate::jobs::{InMemoryJobStore, JobLifecycleManager, LifecycleError};
    use crate::work_queue::{InMemoryWorkQueue, WorkQueue};

    fn identity() -> Identity {
        Identity::new("cognitoUsername", "cognitoSub")
    }

    fn settings() -> PurgeConfig {
        let mut config = PurgeConfig::default();
        config.dispatcher.receive_wait_seconds = 0;
        config
    }

    #[test]
    fn purge_cycle_respects_concurrency_and_queue_freeze() {
        let config = settings();
        let queue_store = InMemoryDeletionQueueStore::arc();
        let deletion_queue = DeletionQueue::new(queue_store.clone());
        let manager = JobLifecycleManager::new(InMemoryJobStore::arc(), queue_store.clone());

        let stored = deletion_queue
            .enqueue(
                vec![NewQueueItem::simple("jane"), NewQueueItem::simple("john")],
                &identity(),
            )
            .unwrap();

        let overrides = JobConfigOverrides {
            concurrency_limit: Some(4),
            ..Default::default()
        };
        let job = manager.create(&config.job_defaults, &overrides, &identity()).unwrap();
        manager.advance(job.id, JobStatus::Running).unwrap();

        // Queue is frozen for the job's lifetime.
        let err = manager.cancel_queue_items(&[stored[0].id]).unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));

        // Planning produced ten query tasks.
        let work = Arc::new(InMemoryWorkQueue::new());
        for i in 0..10 {
            work.send(&json!({ "QueryId": format!("q{i}"), "Database": "db" }).to_string())
                .unwrap();
        }

        let launcher = Arc::new(RecordingLauncher::new());
        let dispatcher = WorkQueueDispatcher::new(work.clone(), launcher.clone(), config.dispatcher.clone());
        let execution = ExecutionId::new("exec-1");

        let first = dispatcher
            .dispatch_for_job(&job, &execution, work.visibility().unwrap())
            .unwrap();
        assert_eq!(first.launched, 4);

        // Nothing acknowledged yet: no capacity left.
        let idle = dispatcher
            .dispatch_for_job(&job, &execution, work.visibility().unwrap())
            .unwrap();
        assert_eq!(idle, DispatchReport::default());

        // Two units finish and acknowledge their deliveries.
        for payload in launcher.launched().iter().take(2) {
            work.acknowledge(&payload.receipt_handle().unwrap()).unwrap();
        }
        let second = dispatcher
            .dispatch_for_job(&job, &execution, work.visibility().unwrap())
            .unwrap();
        assert_eq!(second.quota, 2);
        assert_eq!(second.launched, 2);

        // Drain: each round acknowledges what was launched, then ticks again.
        let mut acked = 2;
        for _ in 0..10 {
            let launched = launcher.launched();
            for payload in &launched[acked..] {
                work.acknowledge(&payload.receipt_handle().unwrap()).unwrap();
            }
            acked = launched.len();
            if work.is_empty().unwrap() {
                break;
            }
            dispatcher
                .dispatch_for_job(&job, &execution, work.visibility().unwrap())
                .unwrap();
        }
        assert_eq!(launcher.launched().len(), 10);
        assert!(work.is_empty().unwrap());

        manager.advance(job.id, JobStatus::ForgetCompleted).unwrap();
        manager.advance(job.id, JobStatus::Completed).unwrap();
        assert_eq!(manager.cancel_queue_items(&[stored[0].id]).unwrap(), 1);
        assert_eq!(deletion_queue.list(None, None).unwrap().items.len(), 1);
    }

    #[test]
    fn orchestrator_event_drives_thread_launched_units() {
        let work = Arc::new(InMemoryWorkQueue::new());
        for i in 0..3 {
            work.send(&json!({ "QueryId": format!("q{i}") }).to_string()).unwrap();
        }

        // Units acknowledge their own deliveries.
        let unit_queue = work.clone();
        let (launcher, outcomes) = ThreadLauncher::new("query-unit", move |payload: TaskPayload| {
            let handle = payload.receipt_handle().ok_or("missing receipt handle")?;
            unit_queue.acknowledge(&handle).map_err(|e| e.to_string())
        });
        let dispatcher = WorkQueueDispatcher::new(work.clone(), launcher, settings().dispatcher);

        let jobs = InMemoryJobStore::arc();
        let manager = JobLifecycleManager::new(jobs.clone(), InMemoryDeletionQueueStore::arc());
        let job = manager
            .create(&settings().job_defaults, &JobConfigOverrides::default(), &identity())
            .unwrap();

        let event: TickEvent = serde_json::from_value(json!({
            "ExecutionId": "arn:execution:1",
            "ExecutionName": job.id.to_string(),
            "QueryQueue": { "Visible": "3", "NotVisible": "0" }
        }))
        .unwrap();
        let report = dispatcher.dispatch_tick(&event, &jobs).unwrap();
        assert_eq!(report.launched, 3);

        for _ in 0..3 {
            let outcome = outcomes.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(outcome.result, Ok(()));
        }
        assert!(work.is_empty().unwrap());
    }
}

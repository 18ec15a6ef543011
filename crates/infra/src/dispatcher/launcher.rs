//! Execution unit launchers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::work_queue::ReceiptHandle;

use super::payload::TaskPayload;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("launcher rejected task: {0}")]
    Rejected(String),

    #[error("launcher unavailable: {0}")]
    Unavailable(String),
}

/// Starts one independent execution unit per task.
///
/// Launching is fire-and-forget: the unit acknowledges its own delivery via
/// the receipt handle in the payload.
pub trait ExecutionLauncher: Send + Sync {
    fn launch(&self, payload: &TaskPayload) -> Result<(), LaunchError>;
}

impl<L> ExecutionLauncher for Arc<L>
where
    L: ExecutionLauncher + ?Sized,
{
    fn launch(&self, payload: &TaskPayload) -> Result<(), LaunchError> {
        (**self).launch(payload)
    }
}

type FailurePredicate = Box<dyn Fn(&TaskPayload) -> bool + Send + Sync>;

/// Records every launched payload instead of running it (tests/dev).
#[derive(Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<TaskPayload>>,
    fail_when: Option<FailurePredicate>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject payloads matching `predicate` (simulates a launch failure).
    pub fn failing_when(predicate: impl Fn(&TaskPayload) -> bool + Send + Sync + 'static) -> Self {
        Self {
            launched: Mutex::new(Vec::new()),
            fail_when: Some(Box::new(predicate)),
        }
    }

    /// Payloads launched so far, in launch order.
    pub fn launched(&self) -> Vec<TaskPayload> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ExecutionLauncher for RecordingLauncher {
    fn launch(&self, payload: &TaskPayload) -> Result<(), LaunchError> {
        if self.fail_when.as_ref().is_some_and(|fail| fail(payload)) {
            return Err(LaunchError::Rejected("simulated failure".to_string()));
        }
        self.launched
            .lock()
            .map_err(|_| LaunchError::Unavailable("lock poisoned".to_string()))?
            .push(payload.clone());
        Ok(())
    }
}

/// Handler run by each [`ThreadLauncher`] unit.
pub type TaskHandler = Arc<dyn Fn(TaskPayload) -> Result<(), String> + Send + Sync>;

/// Outcome of one unit run by [`ThreadLauncher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub receipt_handle: Option<ReceiptHandle>,
    pub result: Result<(), String>,
}

/// Runs each execution unit on its own named OS thread.
///
/// Outcomes are reported on the channel returned by [`ThreadLauncher::new`];
/// the launcher never joins its threads.
pub struct ThreadLauncher {
    name: String,
    handler: TaskHandler,
    outcomes: mpsc::Sender<TaskOutcome>,
    spawned: AtomicU64,
}

impl ThreadLauncher {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(TaskPayload) -> Result<(), String> + Send + Sync + 'static,
    ) -> (Self, mpsc::Receiver<TaskOutcome>) {
        let (tx, rx) = mpsc::channel();
        let launcher = Self {
            name: name.into(),
            handler: Arc::new(handler),
            outcomes: tx,
            spawned: AtomicU64::new(0),
        };
        (launcher, rx)
    }
}

impl ExecutionLauncher for ThreadLauncher {
    fn launch(&self, payload: &TaskPayload) -> Result<(), LaunchError> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let handler = self.handler.clone();
        let outcomes = self.outcomes.clone();
        let payload = payload.clone();

        thread::Builder::new()
            .name(format!("{}-{}", self.name, n))
            .spawn(move || {
                let receipt_handle = payload.receipt_handle();
                let result = handler(payload);
                match &result {
                    Ok(()) => debug!(?receipt_handle, "execution unit finished"),
                    Err(e) => error!(?receipt_handle, error = %e, "execution unit failed"),
                }
                // The receiver may be gone; outcomes are advisory.
                let _ = outcomes.send(TaskOutcome { receipt_handle, result });
            })
            .map_err(|e| LaunchError::Unavailable(format!("failed to spawn execution unit: {e}")))?;
        Ok(())
    }
}

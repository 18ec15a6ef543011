//! In-memory work queue with visibility timeouts.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use lakepurge_core::QueueVisibility;

use super::{ReceiptHandle, WorkQueue, WorkQueueError, WorkQueueMessage};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    seq: u64,
    body: String,
    /// Set while a delivery is outstanding.
    in_flight: Option<Delivery>,
}

#[derive(Debug)]
struct Delivery {
    handle: ReceiptHandle,
    visible_at: Instant,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        self.in_flight.as_ref().is_none_or(|d| d.visible_at <= now)
    }
}

/// A message moved aside by [`WorkQueue::dead_letter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetteredMessage {
    pub body: String,
    pub receipt_handle: ReceiptHandle,
    pub reason: String,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<Entry>,
    next_seq: u64,
    dead: Vec<DeadLetteredMessage>,
}

/// In-memory queue for tests/dev.
///
/// Each delivery gets a fresh receipt handle, so a handle from an expired
/// delivery can no longer acknowledge the message.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    state: Mutex<State>,
    arrivals: Condvar,
    visibility_timeout: Duration,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Condvar::new(),
            visibility_timeout,
        }
    }

    /// Messages moved aside so far, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetteredMessage>, WorkQueueError> {
        Ok(self.lock()?.dead.clone())
    }

    /// Total messages held, visible or not.
    pub fn len(&self) -> Result<usize, WorkQueueError> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, WorkQueueError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, WorkQueueError> {
        self.state
            .lock()
            .map_err(|_| WorkQueueError::State("lock poisoned".to_string()))
    }

    fn take_visible(&self, state: &mut State, max: usize, now: Instant) -> Vec<WorkQueueMessage> {
        let mut out = Vec::new();
        for entry in state.entries.iter_mut() {
            if out.len() >= max {
                break;
            }
            if !entry.is_visible(now) {
                continue;
            }
            if entry.in_flight.is_some() {
                debug!(seq = entry.seq, "redelivering message after visibility timeout");
            }
            let handle = ReceiptHandle::new(format!("{}-{}", entry.seq, Uuid::new_v4().simple()));
            entry.in_flight = Some(Delivery {
                handle: handle.clone(),
                visible_at: now + self.visibility_timeout,
            });
            out.push(WorkQueueMessage {
                body: entry.body.clone(),
                receipt_handle: handle,
            });
        }
        out
    }

    fn position(state: &State, handle: &ReceiptHandle) -> Option<usize> {
        state
            .entries
            .iter()
            .position(|e| e.in_flight.as_ref().is_some_and(|d| &d.handle == handle))
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn send(&self, body: &str) -> Result<(), WorkQueueError> {
        let mut state = self.lock()?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back(Entry {
            seq,
            body: body.to_string(),
            in_flight: None,
        });
        drop(state);
        self.arrivals.notify_all();
        Ok(())
    }

    fn receive(&self, max: usize, wait: Duration) -> Result<Vec<WorkQueueMessage>, WorkQueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        let mut state = self.lock()?;
        loop {
            let now = Instant::now();
            let batch = self.take_visible(&mut state, max, now);
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            // Wake on a send, or when the earliest in-flight delivery expires.
            let next_expiry = state
                .entries
                .iter()
                .filter_map(|e| e.in_flight.as_ref().map(|d| d.visible_at))
                .min()
                .unwrap_or(deadline);
            let until = next_expiry.min(deadline).saturating_duration_since(now);
            let (guard, _) = self
                .arrivals
                .wait_timeout(state, until)
                .map_err(|_| WorkQueueError::State("lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), WorkQueueError> {
        let mut state = self.lock()?;
        let pos = Self::position(&state, handle).ok_or_else(|| WorkQueueError::UnknownReceipt(handle.clone()))?;
        state.entries.remove(pos);
        Ok(())
    }

    fn dead_letter(&self, handle: &ReceiptHandle, reason: &str) -> Result<(), WorkQueueError> {
        let mut state = self.lock()?;
        let pos = Self::position(&state, handle).ok_or_else(|| WorkQueueError::UnknownReceipt(handle.clone()))?;
        if let Some(entry) = state.entries.remove(pos) {
            warn!(receipt_handle = %handle, reason, "message dead-lettered");
            state.dead.push(DeadLetteredMessage {
                body: entry.body,
                receipt_handle: handle.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn visibility(&self) -> Result<QueueVisibility, WorkQueueError> {
        let state = self.lock()?;
        let now = Instant::now();
        let visible = state.entries.iter().filter(|e| e.is_visible(now)).count();
        let not_visible = state.entries.len() - visible;
        Ok(QueueVisibility::new(
            u32::try_from(visible).unwrap_or(u32::MAX),
            u32::try_from(not_visible).unwrap_or(u32::MAX),
        ))
    }
}

//! Deletion queue: match identifiers waiting for the next purge job.
//!
//! ## Components
//!
//! - `DeletionQueueStore`: persistence (in-memory or Postgres)
//! - `DeletionQueue`: enqueue and list on top of a store, with batch validation
//!
//! Removal goes through `JobLifecycleManager::cancel_queue_items`, which
//! holds the active-job gate.

pub mod postgres;
pub mod store;

use chrono::Utc;
use tracing::{debug, info};

use lakepurge_core::{
    validate_queue_items, DeletionQueueItem, Identity, NewQueueItem, QueueItemId, ValidationError,
};

use crate::page::Page;

pub use postgres::PostgresDeletionQueueStore;
pub use store::{DeletionQueueStore, InMemoryDeletionQueueStore, QueueStoreError};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum DeletionQueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] QueueStoreError),
}

/// Enqueue/list operations over a deletion queue store.
#[derive(Debug, Clone)]
pub struct DeletionQueue<S> {
    store: S,
}

impl<S> DeletionQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: DeletionQueueStore> DeletionQueue<S> {
    /// Validate, stamp and persist a batch. Nothing is stored if any item is invalid.
    pub fn enqueue(
        &self,
        items: Vec<NewQueueItem>,
        identity: &Identity,
    ) -> Result<Vec<DeletionQueueItem>, DeletionQueueError> {
        if items.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        validate_queue_items(&items)?;

        let now = Utc::now();
        let stored: Vec<_> = items
            .into_iter()
            .map(|item| item.into_item(now, identity))
            .collect();
        self.store.put_batch(&stored)?;

        info!(count = stored.len(), user = %identity.username, "enqueued deletion queue items");
        Ok(stored)
    }

    pub fn enqueue_one(
        &self,
        item: NewQueueItem,
        identity: &Identity,
    ) -> Result<DeletionQueueItem, DeletionQueueError> {
        let mut stored = self.enqueue(vec![item], identity)?;
        stored
            .pop()
            .ok_or_else(|| QueueStoreError::Storage("enqueue returned no item".to_string()).into())
    }

    /// One page of queued items. `page_size` defaults to [`DEFAULT_PAGE_SIZE`].
    pub fn list(
        &self,
        page_size: Option<usize>,
        start_after: Option<QueueItemId>,
    ) -> Result<Page<DeletionQueueItem, QueueItemId>, DeletionQueueError> {
        let limit = checked_page_size(page_size)?;
        let page = self.store.list(limit, start_after)?;
        debug!(limit, returned = page.items.len(), more = page.next_start.is_some(), "listed deletion queue");
        Ok(page)
    }
}

pub(crate) fn checked_page_size(page_size: Option<usize>) -> Result<usize, ValidationError> {
    let size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&size) {
        return Err(ValidationError::PageSize {
            min: 1,
            max: MAX_PAGE_SIZE,
            got: size,
        });
    }
    Ok(size)
}

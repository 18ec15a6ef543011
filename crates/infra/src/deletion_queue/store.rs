//! Deletion queue storage implementations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use lakepurge_core::{DeletionQueueItem, QueueItemId};

use crate::page::Page;

/// Deletion queue store abstraction.
///
/// The store does not know about jobs. Callers that remove items are expected
/// to have checked the active-job gate first.
pub trait DeletionQueueStore: Send + Sync {
    /// Persist a batch of items atomically (all or none). Existing ids are overwritten.
    fn put_batch(&self, items: &[DeletionQueueItem]) -> Result<(), QueueStoreError>;

    /// Get an item by ID.
    fn get(&self, id: QueueItemId) -> Result<Option<DeletionQueueItem>, QueueStoreError>;

    /// List items in native (id) order, resuming after `start_after`.
    ///
    /// The cursor is a position, not a row: items sorting after it are
    /// returned even if the cursor item has since been removed.
    fn list(
        &self,
        limit: usize,
        start_after: Option<QueueItemId>,
    ) -> Result<Page<DeletionQueueItem, QueueItemId>, QueueStoreError>;

    /// Delete the named items. Unknown ids are ignored; returns how many were removed.
    fn remove(&self, ids: &[QueueItemId]) -> Result<usize, QueueStoreError>;

    /// Number of items currently queued.
    fn count(&self) -> Result<usize, QueueStoreError>;
}

/// Deletion queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl<S> DeletionQueueStore for Arc<S>
where
    S: DeletionQueueStore + ?Sized,
{
    fn put_batch(&self, items: &[DeletionQueueItem]) -> Result<(), QueueStoreError> {
        (**self).put_batch(items)
    }

    fn get(&self, id: QueueItemId) -> Result<Option<DeletionQueueItem>, QueueStoreError> {
        (**self).get(id)
    }

    fn list(
        &self,
        limit: usize,
        start_after: Option<QueueItemId>,
    ) -> Result<Page<DeletionQueueItem, QueueItemId>, QueueStoreError> {
        (**self).list(limit, start_after)
    }

    fn remove(&self, ids: &[QueueItemId]) -> Result<usize, QueueStoreError> {
        (**self).remove(ids)
    }

    fn count(&self) -> Result<usize, QueueStoreError> {
        (**self).count()
    }
}

/// In-memory deletion queue for tests/dev.
///
/// Keyed by a `BTreeMap` so listing order is stable across calls.
#[derive(Debug, Default)]
pub struct InMemoryDeletionQueueStore {
    items: RwLock<BTreeMap<QueueItemId, DeletionQueueItem>>,
}

impl InMemoryDeletionQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> QueueStoreError {
        QueueStoreError::Storage("lock poisoned".to_string())
    }
}

impl DeletionQueueStore for InMemoryDeletionQueueStore {
    fn put_batch(&self, items: &[DeletionQueueItem]) -> Result<(), QueueStoreError> {
        let mut map = self.items.write().map_err(|_| Self::poisoned())?;
        for item in items {
            map.insert(item.id, item.clone());
        }
        Ok(())
    }

    fn get(&self, id: QueueItemId) -> Result<Option<DeletionQueueItem>, QueueStoreError> {
        let map = self.items.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(&id).cloned())
    }

    fn list(
        &self,
        limit: usize,
        start_after: Option<QueueItemId>,
    ) -> Result<Page<DeletionQueueItem, QueueItemId>, QueueStoreError> {
        use std::ops::Bound;

        let map = self.items.read().map_err(|_| Self::poisoned())?;
        let lower = match start_after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };

        let rows: Vec<_> = map
            .range((lower, Bound::Unbounded))
            .take(limit.saturating_add(1))
            .map(|(_, item)| item.clone())
            .collect();

        Ok(Page::from_overfetch(rows, limit, |item| item.id))
    }

    fn remove(&self, ids: &[QueueItemId]) -> Result<usize, QueueStoreError> {
        let mut map = self.items.write().map_err(|_| Self::poisoned())?;
        Ok(ids.iter().filter(|id| map.remove(*id).is_some()).count())
    }

    fn count(&self) -> Result<usize, QueueStoreError> {
        let map = self.items.read().map_err(|_| Self::poisoned())?;
        Ok(map.len())
    }
}

//! Postgres-backed deletion queue store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use lakepurge_core::{DeletionQueueItem, Identity, MatchId, MatchKind, QueueItemId};

use super::store::{DeletionQueueStore, QueueStoreError};
use crate::page::Page;
use crate::pg::PgRuntime;

/// Durable deletion queue stored in the `deletion_queue` table.
///
/// Rows are ordered by primary key; ids are UUIDv7 so that is creation order.
pub struct PostgresDeletionQueueStore {
    pg: Arc<PgRuntime>,
}

impl PostgresDeletionQueueStore {
    pub fn new(pg: Arc<PgRuntime>) -> Self {
        Self { pg }
    }
}

fn storage(e: sqlx::Error) -> QueueStoreError {
    QueueStoreError::Storage(e.to_string())
}

fn kind_str(kind: MatchKind) -> &'static str {
    match kind {
        MatchKind::Simple => "Simple",
        MatchKind::Composite => "Composite",
    }
}

fn row_to_item(row: &PgRow) -> Result<DeletionQueueItem, QueueStoreError> {
    let id: Uuid = row.try_get("id").map_err(storage)?;
    let corrupt = |reason: String| QueueStoreError::Corrupt {
        id: id.to_string(),
        reason,
    };

    let match_id: MatchId = serde_json::from_value(row.try_get("match_id").map_err(storage)?)
        .map_err(|e| corrupt(e.to_string()))?;
    let kind = match row.try_get::<String, _>("kind").map_err(storage)?.as_str() {
        "Simple" => MatchKind::Simple,
        "Composite" => MatchKind::Composite,
        other => return Err(corrupt(format!("unknown kind {other}"))),
    };
    let data_mappers: Vec<String> =
        serde_json::from_value(row.try_get("data_mappers").map_err(storage)?)
            .map_err(|e| corrupt(e.to_string()))?;
    let created_by: Identity = serde_json::from_value(row.try_get("created_by").map_err(storage)?)
        .map_err(|e| corrupt(e.to_string()))?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(storage)?;

    Ok(DeletionQueueItem {
        id: QueueItemId::from_uuid(id),
        match_id,
        kind,
        data_mappers,
        created_at,
        created_by,
    })
}

impl DeletionQueueStore for PostgresDeletionQueueStore {
    fn put_batch(&self, items: &[DeletionQueueItem]) -> Result<(), QueueStoreError> {
        let pool = self.pg.pool();
        self.pg.block_on(async {
            let mut tx = pool.begin().await.map_err(storage)?;
            for item in items {
                let match_id = serde_json::to_value(&item.match_id)
                    .map_err(|e| QueueStoreError::Storage(e.to_string()))?;
                let mappers = serde_json::to_value(&item.data_mappers)
                    .map_err(|e| QueueStoreError::Storage(e.to_string()))?;
                let created_by = serde_json::to_value(&item.created_by)
                    .map_err(|e| QueueStoreError::Storage(e.to_string()))?;

                sqlx::query(
                    r#"
                    INSERT INTO deletion_queue (id, match_id, kind, data_mappers, created_at, created_by)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO UPDATE SET
                        match_id = EXCLUDED.match_id,
                        kind = EXCLUDED.kind,
                        data_mappers = EXCLUDED.data_mappers,
                        created_at = EXCLUDED.created_at,
                        created_by = EXCLUDED.created_by
                    "#,
                )
                .bind(item.id.as_uuid())
                .bind(match_id)
                .bind(kind_str(item.kind))
                .bind(mappers)
                .bind(item.created_at)
                .bind(created_by)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            }
            tx.commit().await.map_err(storage)
        })
    }

    fn get(&self, id: QueueItemId) -> Result<Option<DeletionQueueItem>, QueueStoreError> {
        let pool = self.pg.pool();
        let row = self
            .pg
            .block_on(
                sqlx::query("SELECT * FROM deletion_queue WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_optional(pool),
            )
            .map_err(storage)?;
        row.as_ref().map(row_to_item).transpose()
    }

    fn list(
        &self,
        limit: usize,
        start_after: Option<QueueItemId>,
    ) -> Result<Page<DeletionQueueItem, QueueItemId>, QueueStoreError> {
        let pool = self.pg.pool();
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let after: Option<Uuid> = start_after.map(Uuid::from);

        let rows = self
            .pg
            .block_on(
                sqlx::query(
                    r#"
                    SELECT * FROM deletion_queue
                    WHERE ($1::uuid IS NULL OR id > $1)
                    ORDER BY id
                    LIMIT $2
                    "#,
                )
                .bind(after)
                .bind(fetch)
                .fetch_all(pool),
            )
            .map_err(storage)?;

        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(items, limit, |item| item.id))
    }

    fn remove(&self, ids: &[QueueItemId]) -> Result<usize, QueueStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let pool = self.pg.pool();
        let ids: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
        let result = self
            .pg
            .block_on(
                sqlx::query("DELETE FROM deletion_queue WHERE id = ANY($1)")
                    .bind(&ids)
                    .execute(pool),
            )
            .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }

    fn count(&self) -> Result<usize, QueueStoreError> {
        let pool = self.pg.pool();
        let count: i64 = self
            .pg
            .block_on(sqlx::query_scalar("SELECT COUNT(*) FROM deletion_queue").fetch_one(pool))
            .map_err(storage)?;
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use lakepurge_core::NewQueueItem;

    use super::*;

    #[test]
    fn batch_listing_and_removal_round_trip() {
        let Some(pg) = PgRuntime::test_or_skip() else {
            return;
        };
        let store = PostgresDeletionQueueStore::new(pg);
        let identity = Identity::new("u", "s");

        let mut items: Vec<DeletionQueueItem> = (0..5)
            .map(|i| NewQueueItem::simple(format!("m{i}")).into_item(Utc::now(), &identity))
            .collect();
        store.put_batch(&items).unwrap();
        items.sort_by_key(|item| item.id);
        let ids: Vec<QueueItemId> = items.iter().map(|item| item.id).collect();

        let first = store.list(2, None).unwrap();
        assert_eq!(first.items.iter().map(|i| i.id).collect::<Vec<_>>(), ids[0..2]);
        assert_eq!(first.next_start, Some(ids[1]));

        // Removing the cursor item does not lose the rest of the listing.
        assert_eq!(store.remove(&[ids[1], QueueItemId::new()]).unwrap(), 1);
        let rest = store.list(10, first.next_start).unwrap();
        assert_eq!(rest.items.iter().map(|i| i.id).collect::<Vec<_>>(), ids[2..]);
        assert_eq!(rest.next_start, None);

        assert_eq!(store.count().unwrap(), 4);
        let stored = store.get(ids[0]).unwrap().unwrap();
        assert_eq!(stored.match_id, items[0].match_id);
    }
}

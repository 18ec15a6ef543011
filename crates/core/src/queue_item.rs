//! Deletion queue items: match identifiers waiting to be purged by a job.
//!
//! A match is either a single opaque value (`Simple`) or an ordered set of
//! column/value pairs (`Composite`). A composite match only makes sense against
//! one known schema, so it must reference exactly one data mapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::id::QueueItemId;
use crate::identity::Identity;

/// How a match identifier is interpreted.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchKind {
    #[default]
    Simple,
    Composite,
}

/// One column/value pair of a composite match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatchColumn {
    pub column: String,
    pub value: String,
}

impl MatchColumn {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Shape of the `MatchId` field as supplied by callers.
///
/// The shape is independent of [`MatchKind`]: a caller can claim `Composite`
/// and still send a scalar, which validation must reject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchId {
    Scalar(String),
    Columns(Vec<MatchColumn>),
}

impl MatchId {
    pub fn scalar(value: impl Into<String>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn columns(columns: impl IntoIterator<Item = MatchColumn>) -> Self {
        Self::Columns(columns.into_iter().collect())
    }
}

/// Caller input for one deletion queue entry.
///
/// Missing `Type` defaults to `Simple`; missing `DataMappers` defaults to
/// "all mappers" (an empty list). `DeletionQueueItemId` and `CreatedAt` are
/// normally assigned by the store but may be supplied by a client that wants
/// retries of the same logical enqueue to overwrite rather than duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewQueueItem {
    #[serde(rename = "DeletionQueueItemId", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<QueueItemId>,
    pub match_id: MatchId,
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MatchKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mappers: Option<Vec<String>>,
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewQueueItem {
    pub fn simple(match_id: impl Into<String>) -> Self {
        Self {
            id: None,
            match_id: MatchId::scalar(match_id),
            kind: None,
            data_mappers: None,
            created_at: None,
        }
    }

    pub fn composite(columns: impl IntoIterator<Item = MatchColumn>, data_mapper: impl Into<String>) -> Self {
        Self {
            id: None,
            match_id: MatchId::columns(columns),
            kind: Some(MatchKind::Composite),
            data_mappers: Some(vec![data_mapper.into()]),
            created_at: None,
        }
    }

    pub fn with_kind(mut self, kind: MatchKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_data_mappers(mut self, mappers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.data_mappers = Some(mappers.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_id(mut self, id: QueueItemId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn kind(&self) -> MatchKind {
        self.kind.unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mappers = self.data_mappers.as_deref().unwrap_or(&[]);
        check_match(self.kind(), &self.match_id, mappers)
    }

    /// Fill in store-assigned fields, keeping any the caller already supplied.
    pub fn into_item(self, now: DateTime<Utc>, created_by: &Identity) -> DeletionQueueItem {
        DeletionQueueItem {
            kind: self.kind(),
            id: self.id.unwrap_or_default(),
            match_id: self.match_id,
            data_mappers: self.data_mappers.unwrap_or_default(),
            created_at: self.created_at.unwrap_or(now),
            created_by: created_by.clone(),
        }
    }
}

/// A persisted deletion queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeletionQueueItem {
    #[serde(rename = "DeletionQueueItemId")]
    pub id: QueueItemId,
    pub match_id: MatchId,
    #[serde(rename = "Type", default)]
    pub kind: MatchKind,
    #[serde(default)]
    pub data_mappers: Vec<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    pub created_by: Identity,
}

impl DeletionQueueItem {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_match(self.kind, &self.match_id, &self.data_mappers)
    }
}

/// Validate a batch, all-or-nothing: the first violation aborts the batch.
pub fn validate_queue_items<'a>(
    items: impl IntoIterator<Item = &'a NewQueueItem>,
) -> Result<(), ValidationError> {
    items.into_iter().try_for_each(NewQueueItem::validate)
}

fn check_match(kind: MatchKind, match_id: &MatchId, data_mappers: &[String]) -> Result<(), ValidationError> {
    match (kind, match_id) {
        (MatchKind::Simple, MatchId::Scalar(_)) => Ok(()),
        (MatchKind::Simple, MatchId::Columns(_)) => Err(ValidationError::SimpleNotScalar),
        (MatchKind::Composite, MatchId::Scalar(_)) => Err(ValidationError::NotAnArray),
        (MatchKind::Composite, MatchId::Columns(columns)) => {
            if columns.is_empty() {
                return Err(ValidationError::EmptyCompositeKey);
            }
            if data_mappers.len() != 1 {
                return Err(ValidationError::WrongMapperCount);
            }
            Ok(())
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use glyphmart_core::{ActorKey, Counters, InteractionKey, InteractionKind, Subject, SubjectId};

/// Store operation error.
///
/// `Unavailable`, `Timeout` and `Conflict` are transient: the call may be
/// retried (and a timed-out write may already have been applied).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("subject not found: {0}")]
    SubjectNotFound(SubjectId),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::Conflict(_)
        )
    }
}

/// Result of a like toggle as applied by the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ToggleOutcome {
    /// Whether the event exists after the toggle.
    pub present: bool,
    /// Counter value after the toggle.
    pub total: u64,
}

/// Whole-store totals for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub subjects: u64,
    /// Ledger size per kind (not the projected counters).
    pub events: Counters,
}

/// Subject records and their counter projection.
///
/// Counter fields are never written directly by callers: they change through
/// [`EventLedger`] deltas or through [`SubjectStore::replace_counters`].
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError>;

    /// Multi-get. Returns the records that exist, in no particular order.
    async fn get_subjects(&self, ids: &[SubjectId]) -> Result<Vec<Subject>, StoreError>;

    /// Largest id list a single `get_subjects` call accepts (`None` = unbounded).
    fn max_batch_get(&self) -> Option<usize> {
        None
    }

    /// Subject ids in ascending order, strictly after `after`.
    async fn list_subject_ids(
        &self,
        after: Option<&SubjectId>,
        limit: usize,
    ) -> Result<Vec<SubjectId>, StoreError>;

    /// Create a subject, or update the metadata of an existing one.
    ///
    /// New subjects start with zero counters; existing counters are kept.
    async fn put_subject(&self, subject: &Subject) -> Result<(), StoreError>;

    /// Delete a subject and its ledger events. Returns whether it existed.
    async fn delete_subject(&self, id: &SubjectId) -> Result<bool, StoreError>;

    /// Absolute overwrite of the projection, guarded by compare-and-set.
    ///
    /// Fails with `Conflict` when the stored counters no longer equal
    /// `observed`. Always stamps `last_count_sync` on success.
    async fn replace_counters(
        &self,
        id: &SubjectId,
        observed: Counters,
        new: Counters,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Subjects ordered by the given counter, highest first.
    async fn top_subjects(&self, kind: InteractionKind, limit: usize) -> Result<Vec<Subject>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Append-only interaction ledger (source of truth for the counters).
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Create the event if absent and bump the matching counter, atomically.
    ///
    /// Returns `false` for a duplicate (nothing written). A missing subject
    /// fails with `SubjectNotFound` and leaves no event behind.
    async fn record_if_absent(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Delete-and-decrement or insert-and-increment, atomically per subject.
    async fn toggle(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<ToggleOutcome, StoreError>;

    async fn contains(&self, key: &InteractionKey) -> Result<bool, StoreError>;

    /// Number of events of `kind` for `subject` (keys only, no bodies).
    async fn count(&self, subject: &SubjectId, kind: InteractionKind) -> Result<u64, StoreError>;

    async fn subjects_for_actor(&self, actor: &ActorKey, kind: InteractionKind) -> Result<Vec<SubjectId>, StoreError>;
}

/// A backend that holds both subjects and the ledger, so event writes and
/// counter deltas can share one atomic unit.
pub trait Store: SubjectStore + EventLedger {}

impl<T> Store for T where T: SubjectStore + EventLedger + ?Sized {}

#[async_trait]
impl<S> SubjectStore for Arc<S>
where
    S: SubjectStore + ?Sized,
{
    async fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        (**self).get_subject(id).await
    }

    async fn get_subjects(&self, ids: &[SubjectId]) -> Result<Vec<Subject>, StoreError> {
        (**self).get_subjects(ids).await
    }

    fn max_batch_get(&self) -> Option<usize> {
        (**self).max_batch_get()
    }

    async fn list_subject_ids(
        &self,
        after: Option<&SubjectId>,
        limit: usize,
    ) -> Result<Vec<SubjectId>, StoreError> {
        (**self).list_subject_ids(after, limit).await
    }

    async fn put_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        (**self).put_subject(subject).await
    }

    async fn delete_subject(&self, id: &SubjectId) -> Result<bool, StoreError> {
        (**self).delete_subject(id).await
    }

    async fn replace_counters(
        &self,
        id: &SubjectId,
        observed: Counters,
        new: Counters,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).replace_counters(id, observed, new, synced_at).await
    }

    async fn top_subjects(&self, kind: InteractionKind, limit: usize) -> Result<Vec<Subject>, StoreError> {
        (**self).top_subjects(kind, limit).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        (**self).stats().await
    }
}

#[async_trait]
impl<S> EventLedger for Arc<S>
where
    S: EventLedger + ?Sized,
{
    async fn record_if_absent(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        (**self).record_if_absent(key, at).await
    }

    async fn toggle(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<ToggleOutcome, StoreError> {
        (**self).toggle(key, at).await
    }

    async fn contains(&self, key: &InteractionKey) -> Result<bool, StoreError> {
        (**self).contains(key).await
    }

    async fn count(&self, subject: &SubjectId, kind: InteractionKind) -> Result<u64, StoreError> {
        (**self).count(subject, kind).await
    }

    async fn subjects_for_actor(&self, actor: &ActorKey, kind: InteractionKind) -> Result<Vec<SubjectId>, StoreError> {
        (**self).subjects_for_actor(actor, kind).await
    }
}

//! Subject store and interaction ledger boundary.
//!
//! The traits make no storage assumptions; `InMemoryStore` serves tests/dev
//! and `PostgresStore` is the durable backend.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use glyphmart_core::{ActorKey, Counters, InteractionKey, InteractionKind, Subject, SubjectId};

use crate::config::StoreConfig;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use r#trait::{EventLedger, Store, StoreError, StoreStats, SubjectStore, ToggleOutcome};

/// Adapter that bounds every store call with a timeout.
///
/// A timed-out call surfaces as `StoreError::Timeout`; the underlying write
/// may still have been applied, which is safe because event writes are
/// create-if-absent and counter corrections are absolute.
pub struct TimedStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimedStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn timed<T, F>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<S> SubjectStore for TimedStore<S>
where
    S: SubjectStore,
{
    async fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        self.timed("get_subject", self.inner.get_subject(id)).await
    }

    async fn get_subjects(&self, ids: &[SubjectId]) -> Result<Vec<Subject>, StoreError> {
        self.timed("get_subjects", self.inner.get_subjects(ids)).await
    }

    fn max_batch_get(&self) -> Option<usize> {
        self.inner.max_batch_get()
    }

    async fn list_subject_ids(
        &self,
        after: Option<&SubjectId>,
        limit: usize,
    ) -> Result<Vec<SubjectId>, StoreError> {
        self.timed("list_subject_ids", self.inner.list_subject_ids(after, limit))
            .await
    }

    async fn put_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        self.timed("put_subject", self.inner.put_subject(subject)).await
    }

    async fn delete_subject(&self, id: &SubjectId) -> Result<bool, StoreError> {
        self.timed("delete_subject", self.inner.delete_subject(id)).await
    }

    async fn replace_counters(
        &self,
        id: &SubjectId,
        observed: Counters,
        new: Counters,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed(
            "replace_counters",
            self.inner.replace_counters(id, observed, new, synced_at),
        )
        .await
    }

    async fn top_subjects(&self, kind: InteractionKind, limit: usize) -> Result<Vec<Subject>, StoreError> {
        self.timed("top_subjects", self.inner.top_subjects(kind, limit)).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.timed("stats", self.inner.stats()).await
    }
}

#[async_trait]
impl<S> EventLedger for TimedStore<S>
where
    S: EventLedger,
{
    async fn record_if_absent(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.timed("record_if_absent", self.inner.record_if_absent(key, at)).await
    }

    async fn toggle(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<ToggleOutcome, StoreError> {
        self.timed("toggle", self.inner.toggle(key, at)).await
    }

    async fn contains(&self, key: &InteractionKey) -> Result<bool, StoreError> {
        self.timed("contains", self.inner.contains(key)).await
    }

    async fn count(&self, subject: &SubjectId, kind: InteractionKind) -> Result<u64, StoreError> {
        self.timed("count", self.inner.count(subject, kind)).await
    }

    async fn subjects_for_actor(&self, actor: &ActorKey, kind: InteractionKind) -> Result<Vec<SubjectId>, StoreError> {
        self.timed("subjects_for_actor", self.inner.subjects_for_actor(actor, kind))
            .await
    }
}

/// Open the backend selected by `config`, wrapped with the call timeout.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match (config.persistent, config.database_url.as_deref()) {
        (true, Some(url)) => {
            let store = PostgresStore::connect(url).await?;
            tracing::info!("using postgres store");
            Ok(Arc::new(TimedStore::new(store, config.timeout)))
        }
        (true, None) => Err(StoreError::Unavailable("DATABASE_URL is not configured".to_string())),
        (false, _) => {
            tracing::info!("using in-memory store");
            let store = InMemoryStore::new().with_max_batch_get(config.max_batch_get);
            Ok(Arc::new(TimedStore::new(store, config.timeout)))
        }
    }
}

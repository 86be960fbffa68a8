//! Grouped multi-get of subjects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use glyphmart_core::{Entity, Subject, SubjectId};

use crate::store::{StoreError, SubjectStore};

/// Per-key result of a grouped lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// A grouped fetch failed. Never reported as "not found".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("multi-get of chunk {chunk} failed: {source}")]
    Store {
        chunk: usize,
        #[source]
        source: StoreError,
    },
}

impl BatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BatchError::Store { source, .. } => source.is_retryable(),
        }
    }
}

/// Coalesces single-key subject lookups into chunked multi-get calls.
pub struct BatchFetcher<S: ?Sized> {
    store: Arc<S>,
    max_batch: usize,
}

impl<S> BatchFetcher<S>
where
    S: SubjectStore + ?Sized,
{
    /// `max_batch` is further capped by the store's own multi-get limit.
    pub fn new(store: Arc<S>, max_batch: usize) -> Self {
        Self {
            store,
            max_batch: max_batch.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        match self.store.max_batch_get() {
            Some(limit) => self.max_batch.min(limit.max(1)),
            None => self.max_batch,
        }
    }

    /// Fetch every id; each requested id appears in the result exactly once.
    pub async fn request_many(
        &self,
        ids: impl IntoIterator<Item = SubjectId>,
    ) -> Result<HashMap<SubjectId, Lookup<Subject>>, BatchError> {
        let mut seen = HashSet::new();
        let unique: Vec<SubjectId> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();

        let mut out: HashMap<SubjectId, Lookup<Subject>> =
            unique.iter().map(|id| (id.clone(), Lookup::NotFound)).collect();
        if unique.is_empty() {
            return Ok(out);
        }

        let chunk_size = self.chunk_size();
        debug!(keys = unique.len(), chunk_size, "batched subject lookup");

        for (chunk, ids) in unique.chunks(chunk_size).enumerate() {
            let found = self
                .store
                .get_subjects(ids)
                .await
                .map_err(|source| BatchError::Store { chunk, source })?;
            for subject in found {
                if let Some(slot) = out.get_mut(subject.id()) {
                    *slot = Lookup::Found(subject);
                }
            }
        }
        Ok(out)
    }
}

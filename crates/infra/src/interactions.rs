//! Recording views/downloads and toggling likes.
//!
//! Every write goes through the ledger's create-if-absent / toggle primitive,
//! which applies the event and the counter delta as one atomic unit. The
//! composite interaction key is the only existence test.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use glyphmart_auth::VerifiedActor;
use glyphmart_core::{ActorId, ActorKey, InteractionKey, InteractionKind, SubjectId};

use crate::cache::{CacheKey, ReadCache};
use crate::retry::RetryPolicy;
use crate::store::{EventLedger, Store, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InteractionError {
    #[error("subject not found: {0}")]
    SubjectNotFound(SubjectId),

    #[error("store failure: {0}")]
    Store(#[source] StoreError),
}

impl InteractionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            InteractionError::SubjectNotFound(_) => false,
            InteractionError::Store(e) => e.is_retryable(),
        }
    }
}

impl From<StoreError> for InteractionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SubjectNotFound(id) => InteractionError::SubjectNotFound(id),
            other => InteractionError::Store(other),
        }
    }
}

/// Whether a record call created a new event (`false` = duplicate).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Recorded(pub bool);

impl Recorded {
    pub fn is_new(self) -> bool {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeToggle {
    pub liked: bool,
    pub total_likes: u64,
}

pub struct InteractionService<S: ?Sized> {
    store: Arc<S>,
    cache: Arc<ReadCache>,
    retry: RetryPolicy,
}

impl<S> InteractionService<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>, cache: Arc<ReadCache>, retry: RetryPolicy) -> Self {
        Self { store, cache, retry }
    }

    #[instrument(skip_all, fields(subject_id = %subject, actor = %actor))]
    pub async fn record_view(&self, subject: &SubjectId, actor: &ActorKey) -> Result<Recorded, InteractionError> {
        self.record(subject, actor, InteractionKind::View).await
    }

    #[instrument(skip_all, fields(subject_id = %subject, actor = %actor))]
    pub async fn record_download(
        &self,
        subject: &SubjectId,
        actor: &ActorKey,
    ) -> Result<Recorded, InteractionError> {
        self.record(subject, actor, InteractionKind::Download).await
    }

    async fn record(
        &self,
        subject: &SubjectId,
        actor: &ActorKey,
        kind: InteractionKind,
    ) -> Result<Recorded, InteractionError> {
        let key = &InteractionKey::new(subject.clone(), actor.clone(), kind);
        let at = Utc::now();
        let store = &self.store;
        let uncertain = &AtomicBool::new(false);

        // Create-if-absent is idempotent, so a retry after a timed-out but
        // applied attempt reports a duplicate instead of double counting.
        let result = self
            .retry
            .run("record_if_absent", move || async move {
                let result = store.record_if_absent(key, at).await;
                if result.as_ref().is_err_and(StoreError::is_retryable) {
                    uncertain.store(true, Ordering::Relaxed);
                }
                result
            })
            .await;

        // A failed attempt may still have been applied.
        if uncertain.load(Ordering::Relaxed) {
            self.cache.invalidate_subject(subject);
        }
        let created = result?;

        if created {
            self.cache.invalidate_subject(subject);
            debug!(%kind, "interaction recorded");
        } else {
            debug!(%kind, "duplicate interaction ignored");
        }
        Ok(Recorded(created))
    }

    /// Flip the actor's like on `subject`.
    ///
    /// Not retried here: replaying a toggle whose first attempt was applied
    /// would flip it back.
    #[instrument(skip_all, fields(subject_id = %subject, actor = %actor.id()))]
    pub async fn toggle_like(
        &self,
        subject: &SubjectId,
        actor: &VerifiedActor,
    ) -> Result<LikeToggle, InteractionError> {
        let key = InteractionKey::new(subject.clone(), actor.actor_key(), InteractionKind::Like);
        let outcome = match self.store.toggle(&key, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_retryable() {
                    self.cache.invalidate_subject(subject);
                    self.cache.invalidate(&CacheKey::liked_by(actor.id()));
                }
                return Err(e.into());
            }
        };

        self.cache.invalidate_subject(subject);
        self.cache.invalidate(&CacheKey::liked_by(actor.id()));
        debug!(liked = outcome.present, total = outcome.total, "like toggled");

        Ok(LikeToggle {
            liked: outcome.present,
            total_likes: outcome.total,
        })
    }

    /// Point existence check on the like ledger.
    pub async fn has_liked(&self, subject: &SubjectId, actor: &ActorId) -> Result<bool, InteractionError> {
        let key = InteractionKey::new(subject.clone(), ActorKey::verified(actor), InteractionKind::Like);
        Ok(self.store.contains(&key).await?)
    }
}

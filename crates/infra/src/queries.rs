//! Cache-aware reads over subjects, plus the create/delete glue that feeds
//! the mutation invalidation hook.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use glyphmart_auth::{AdminPolicy, VerifiedActor};
use glyphmart_core::{ActorId, ActorKey, Counters, DomainError, InteractionKind, Subject, SubjectId};

use crate::batch::{BatchError, BatchFetcher, Lookup};
use crate::cache::{CacheClass, CacheKey, ReadCache};
use crate::store::{EventLedger, Store, StoreError, SubjectStore};

pub const MAX_POPULAR: usize = 100;
pub const MAX_COUNTS_BATCH: usize = 500;
const ADMIN_TOP_VIEWED: usize = 10;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("subject not found: {0}")]
    SubjectNotFound(SubjectId),

    #[error("{actor} may not modify subject {subject}")]
    Forbidden { subject: SubjectId, actor: ActorId },

    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("store failure: {0}")]
    Store(#[source] StoreError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

impl QueryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Store(e) => e.is_retryable(),
            QueryError::Batch(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SubjectNotFound(id) => QueryError::SubjectNotFound(id),
            other => QueryError::Store(other),
        }
    }
}

/// Dashboard aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub total_subjects: u64,
    /// Ledger sizes per kind (not the projection).
    pub events: Counters,
    pub top_viewed: Vec<Subject>,
    pub generated_at: DateTime<Utc>,
}

pub struct SubjectQueries<S: ?Sized> {
    store: Arc<S>,
    cache: Arc<ReadCache>,
    fetcher: BatchFetcher<S>,
}

impl<S> SubjectQueries<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>, cache: Arc<ReadCache>, max_batch_get: usize) -> Self {
        let fetcher = BatchFetcher::new(store.clone(), max_batch_get);
        Self { store, cache, fetcher }
    }

    #[instrument(skip(self), fields(subject_id = %id))]
    pub async fn subject(&self, id: &SubjectId) -> Result<Subject, QueryError> {
        let store = &self.store;
        self.cache
            .get_or_load(&CacheKey::subject(id), || async move {
                let found = store.get_subject(id).await.map_err(QueryError::from)?;
                found.ok_or_else(|| QueryError::SubjectNotFound(id.clone()))
            })
            .await
    }

    /// Counters for many subjects. Unknown ids read as zero.
    #[instrument(skip_all, fields(requested = ids.len()))]
    pub async fn counts_many(&self, ids: &[SubjectId]) -> Result<BTreeMap<SubjectId, Counters>, QueryError> {
        if ids.len() > MAX_COUNTS_BATCH {
            return Err(DomainError::validation(format!("at most {MAX_COUNTS_BATCH} ids per request")).into());
        }

        let mut out = BTreeMap::new();
        let mut misses = Vec::new();
        for id in ids {
            if out.contains_key(id) {
                continue;
            }
            match self.cache.get::<Counters>(&CacheKey::counts(id)) {
                Some(counters) => {
                    out.insert(id.clone(), counters);
                }
                None => misses.push(id.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }

        let generation = self.cache.generation();
        for (id, lookup) in self.fetcher.request_many(misses).await? {
            let counters = match lookup {
                Lookup::Found(subject) => {
                    if let Err(e) = self.cache.put_if_unchanged(&CacheKey::counts(&id), &subject.counters, generation) {
                        warn!(subject_id = %id, error = %e, "failed to cache counters");
                    }
                    subject.counters
                }
                Lookup::NotFound => Counters::default(),
            };
            out.insert(id, counters);
        }
        Ok(out)
    }

    /// Most downloaded subjects; `limit` is clamped to 1..=100.
    pub async fn popular(&self, limit: usize) -> Result<Vec<Subject>, QueryError> {
        let limit = limit.clamp(1, MAX_POPULAR);
        let store = &self.store;
        self.cache
            .get_or_load(&CacheKey::popular(limit), || async move {
                store
                    .top_subjects(InteractionKind::Download, limit)
                    .await
                    .map_err(QueryError::from)
            })
            .await
    }

    /// Subjects the actor currently likes. Deleted subjects are left out.
    #[instrument(skip_all, fields(actor = %actor))]
    pub async fn liked_by(&self, actor: &ActorId) -> Result<Vec<Subject>, QueryError> {
        let store = &self.store;
        let fetcher = &self.fetcher;
        self.cache
            .get_or_load(&CacheKey::liked_by(actor), || async move {
                let ids = store
                    .subjects_for_actor(&ActorKey::verified(actor), InteractionKind::Like)
                    .await
                    .map_err(QueryError::from)?;
                let mut found = fetcher.request_many(ids.iter().cloned()).await?;
                Ok::<Vec<Subject>, QueryError>(
                    ids.iter()
                        .filter_map(|id| found.remove(id).and_then(Lookup::found))
                        .collect(),
                )
            })
            .await
    }

    pub async fn admin_stats(&self) -> Result<AdminStats, QueryError> {
        let store = &self.store;
        self.cache
            .get_or_load(&CacheKey::admin_stats(), || async move {
                let stats = store.stats().await.map_err(QueryError::from)?;
                let top_viewed = store.top_subjects(InteractionKind::View, ADMIN_TOP_VIEWED).await?;
                Ok::<_, QueryError>(AdminStats {
                    total_subjects: stats.subjects,
                    events: stats.events,
                    top_viewed,
                    generated_at: Utc::now(),
                })
            })
            .await
    }

    #[instrument(skip_all, fields(owner = %owner.id()))]
    pub async fn create_subject(&self, owner: &VerifiedActor, title: &str) -> Result<Subject, QueryError> {
        let subject = Subject::new(SubjectId::new(), owner.id().clone(), title, Utc::now())?;
        self.store.put_subject(&subject).await?;

        self.cache.invalidate_subject(&subject.id);
        self.cache.invalidate_rankings();
        info!(subject_id = %subject.id, "subject created");
        Ok(subject)
    }

    /// Delete a subject and its ledger events. Owner or admin only.
    #[instrument(skip(self, actor, policy), fields(subject_id = %id, actor = %actor.id()))]
    pub async fn delete_subject(
        &self,
        id: &SubjectId,
        actor: &VerifiedActor,
        policy: &AdminPolicy,
    ) -> Result<(), QueryError> {
        let subject = self
            .store
            .get_subject(id)
            .await?
            .ok_or_else(|| QueryError::SubjectNotFound(id.clone()))?;

        if &subject.owner != actor.id() && !policy.is_admin(actor) {
            return Err(QueryError::Forbidden {
                subject: id.clone(),
                actor: actor.id().clone(),
            });
        }
        if !self.store.delete_subject(id).await? {
            return Err(QueryError::SubjectNotFound(id.clone()));
        }

        self.cache.invalidate_subject(id);
        self.cache.invalidate_rankings();
        // Liked-subject lists of any actor may reference it.
        self.cache.invalidate_class(CacheClass::Profile);
        info!("subject deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::InMemoryStore;
    use glyphmart_auth::{IdentityVerifier, Role, StaticIdentityVerifier};
    use glyphmart_core::InteractionKey;

    fn actor(id: &str, roles: Vec<Role>) -> VerifiedActor {
        StaticIdentityVerifier::new()
            .with_actor("tok", id, roles)
            .verify("tok", Utc::now())
            .unwrap()
    }

    fn fixture() -> (Arc<InMemoryStore>, Arc<ReadCache>, SubjectQueries<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new().with_max_batch_get(2));
        let cache = Arc::new(ReadCache::init(CacheConfig::default()));
        let queries = SubjectQueries::new(store.clone(), cache.clone(), 10);
        (store, cache, queries)
    }

    fn key(subject: &SubjectId, actor: &str, kind: InteractionKind) -> InteractionKey {
        InteractionKey::new(subject.clone(), ActorKey::parse(actor).unwrap(), kind)
    }

    #[tokio::test]
    async fn subject_reads_are_cached_until_invalidated() {
        let (store, cache, queries) = fixture();
        let owner = actor("owner", vec![]);
        let created = queries.create_subject(&owner, "Pulse").await.unwrap();

        let first = queries.subject(&created.id).await.unwrap();
        store
            .record_if_absent(&key(&created.id, "U1", InteractionKind::View), Utc::now())
            .await
            .unwrap();
        // The write bypassed the service, so the cached copy is served.
        assert_eq!(queries.subject(&created.id).await.unwrap(), first);

        cache.invalidate_subject(&created.id);
        assert_eq!(queries.subject(&created.id).await.unwrap().counters.views, 1);
    }

    #[tokio::test]
    async fn missing_subject_is_not_found() {
        let (_, _, queries) = fixture();
        let id = SubjectId::parse("ghost").unwrap();
        assert_eq!(queries.subject(&id).await, Err(QueryError::SubjectNotFound(id)));
    }

    #[tokio::test]
    async fn counts_many_mixes_cache_hits_fetches_and_unknown_ids() {
        let (store, cache, queries) = fixture();
        let owner = actor("owner", vec![]);
        let mut ids = Vec::new();
        for title in ["a", "b", "c"] {
            ids.push(queries.create_subject(&owner, title).await.unwrap().id);
        }
        store
            .record_if_absent(&key(&ids[1], "U1", InteractionKind::Download), Utc::now())
            .await
            .unwrap();
        cache.put(&CacheKey::counts(&ids[0]), &Counters::new(9, 9, 9)).unwrap();

        let ghost = SubjectId::parse("ghost").unwrap();
        let mut request = ids.clone();
        request.push(ghost.clone());
        request.push(ids[1].clone());

        let counts = queries.counts_many(&request).await.unwrap();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[&ids[0]], Counters::new(9, 9, 9));
        assert_eq!(counts[&ids[1]].downloads, 1);
        assert_eq!(counts[&ids[2]], Counters::default());
        assert_eq!(counts[&ghost], Counters::default());
        assert_eq!(cache.get::<Counters>(&CacheKey::counts(&ids[1])).map(|c| c.downloads), Some(1));
        assert_eq!(cache.get::<Counters>(&CacheKey::counts(&ghost)), None);
    }

    #[tokio::test]
    async fn oversized_counts_request_is_rejected() {
        let (_, _, queries) = fixture();
        let ids: Vec<SubjectId> = (0..=MAX_COUNTS_BATCH).map(|_| SubjectId::new()).collect();
        assert!(matches!(queries.counts_many(&ids).await, Err(QueryError::Invalid(_))));
    }

    #[tokio::test]
    async fn popular_orders_by_downloads_and_clamps_limit() {
        let (store, _, queries) = fixture();
        let owner = actor("owner", vec![]);
        let quiet = queries.create_subject(&owner, "quiet").await.unwrap().id;
        let hot = queries.create_subject(&owner, "hot").await.unwrap().id;
        for u in ["a", "b"] {
            store
                .record_if_absent(&key(&hot, u, InteractionKind::Download), Utc::now())
                .await
                .unwrap();
        }

        let top = queries.popular(0).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, hot);
        let all = queries.popular(1000).await.unwrap();
        assert_eq!(all.iter().map(|s| s.id.clone()).collect::<Vec<_>>(), vec![hot, quiet]);
    }

    #[tokio::test]
    async fn liked_by_follows_the_like_ledger() {
        let (store, _, queries) = fixture();
        let owner = actor("owner", vec![]);
        let fan = actor("fan", vec![]);
        let a = queries.create_subject(&owner, "a").await.unwrap().id;
        let b = queries.create_subject(&owner, "b").await.unwrap().id;
        for id in [&a, &b] {
            let k = InteractionKey::new(id.clone(), fan.actor_key(), InteractionKind::Like);
            store.toggle(&k, Utc::now()).await.unwrap();
        }

        let mut liked: Vec<SubjectId> = queries.liked_by(fan.id()).await.unwrap().into_iter().map(|s| s.id).collect();
        liked.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(liked, expected);

        queries.delete_subject(&a, &owner, &AdminPolicy::default()).await.unwrap();
        let after: Vec<SubjectId> = queries.liked_by(fan.id()).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(after, vec![b]);
    }

    #[tokio::test]
    async fn admin_stats_totals_the_ledger() {
        let (store, _, queries) = fixture();
        let owner = actor("owner", vec![]);
        let id = queries.create_subject(&owner, "a").await.unwrap().id;
        store
            .record_if_absent(&key(&id, "U1", InteractionKind::View), Utc::now())
            .await
            .unwrap();

        let stats = queries.admin_stats().await.unwrap();
        assert_eq!(stats.total_subjects, 1);
        assert_eq!(stats.events, Counters::new(1, 0, 0));
        assert_eq!(stats.top_viewed.len(), 1);

        // Creating a subject invalidates the cached aggregate.
        queries.create_subject(&owner, "b").await.unwrap();
        assert_eq!(queries.admin_stats().await.unwrap().total_subjects, 2);
    }

    #[tokio::test]
    async fn only_owner_or_admin_may_delete() {
        let (_, _, queries) = fixture();
        let owner = actor("owner", vec![]);
        let stranger = actor("stranger", vec![]);
        let id = queries.create_subject(&owner, "a").await.unwrap().id;
        let policy = AdminPolicy::new([ActorId::parse("root").unwrap()]);

        assert!(matches!(
            queries.delete_subject(&id, &stranger, &policy).await,
            Err(QueryError::Forbidden { .. })
        ));
        queries
            .delete_subject(&id, &actor("root", vec![]), &policy)
            .await
            .unwrap();
        assert_eq!(
            queries.delete_subject(&id, &owner, &policy).await,
            Err(QueryError::SubjectNotFound(id.clone()))
        );
        assert_eq!(queries.subject(&id).await, Err(QueryError::SubjectNotFound(id)));
    }

    #[tokio::test]
    async fn invalid_title_is_rejected() {
        let (_, _, queries) = fixture();
        assert!(matches!(
            queries.create_subject(&actor("owner", vec![]), "  ").await,
            Err(QueryError::Invalid(_))
        ));
    }
}

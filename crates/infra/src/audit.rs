//! Drift detection and repair between the ledger and the counter projection.
//!
//! The ledger is the source of truth. An audit counts ledger keys per kind
//! and overwrites the projection with the absolute totals (never a delta),
//! so re-running an audit is always safe.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use glyphmart_core::{Counters, InteractionKind, SubjectId};

use crate::cache::ReadCache;
use crate::store::{EventLedger, Store, StoreError, SubjectStore};

/// Upper bound for one audit page.
pub const MAX_BATCH_SIZE: usize = 500;

/// Compare-and-set attempts before a subject counts as contended.
const CAS_ATTEMPTS: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuditError {
    #[error("subject not found: {0}")]
    SubjectNotFound(SubjectId),

    #[error("counters of {subject} kept changing during audit ({attempts} attempts)")]
    Contended { subject: SubjectId, attempts: u32 },

    #[error("store failure: {0}")]
    Store(#[source] StoreError),

    #[error("{failed} of {attempted} subjects in the batch failed")]
    BatchFailed {
        failed: u64,
        attempted: u64,
        summary: AuditSummary,
    },
}

impl From<StoreError> for AuditError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SubjectNotFound(id) => AuditError::SubjectNotFound(id),
            other => AuditError::Store(other),
        }
    }
}

/// Outcome of auditing one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub subject_id: SubjectId,
    pub views: u64,
    pub downloads: u64,
    pub likes: u64,
    pub corrected: bool,
    /// Projection as found before the audit.
    pub before: Counters,
    pub synced_at: DateTime<Utc>,
}

impl AuditReport {
    pub fn counters(&self) -> Counters {
        Counters::new(self.views, self.downloads, self.likes)
    }
}

/// Outcome of auditing one page (or, for `audit_everything`, all pages).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    /// Subjects audited successfully.
    pub checked: u64,
    pub corrected: u64,
    /// Subjects deleted while the audit ran.
    pub skipped: u64,
    pub errors: u64,
    /// Resume point; `None` once the last page has been processed.
    pub next_cursor: Option<SubjectId>,
}

impl AuditSummary {
    fn absorb(&mut self, page: &AuditSummary) {
        self.checked += page.checked;
        self.corrected += page.corrected;
        self.skipped += page.skipped;
        self.errors += page.errors;
        self.next_cursor = page.next_cursor.clone();
    }
}

pub struct DriftAuditor<S: ?Sized> {
    store: Arc<S>,
    cache: Arc<ReadCache>,
    default_batch_size: usize,
}

impl<S> DriftAuditor<S>
where
    S: Store + ?Sized,
{
    pub fn new(store: Arc<S>, cache: Arc<ReadCache>, default_batch_size: usize) -> Self {
        Self {
            store,
            cache,
            default_batch_size: default_batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    /// Recount one subject's ledger and overwrite its projection if it drifted.
    ///
    /// The sync timestamp is written on every successful audit.
    #[instrument(skip(self), fields(subject_id = %id))]
    pub async fn audit_subject(&self, id: &SubjectId) -> Result<AuditReport, AuditError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let subject = self
                .store
                .get_subject(id)
                .await?
                .ok_or_else(|| AuditError::SubjectNotFound(id.clone()))?;

            let mut truth = Counters::default();
            for kind in InteractionKind::ALL {
                truth.set(kind, self.store.count(id, kind).await?);
            }

            let before = subject.counters;
            let synced_at = Utc::now();
            match self.store.replace_counters(id, before, truth, synced_at).await {
                Ok(()) => {
                    let corrected = truth != before;
                    if corrected {
                        info!(
                            before.views = before.views,
                            before.downloads = before.downloads,
                            before.likes = before.likes,
                            after.views = truth.views,
                            after.downloads = truth.downloads,
                            after.likes = truth.likes,
                            "counter drift corrected"
                        );
                        self.cache.invalidate_subject(id);
                        self.cache.invalidate_rankings();
                    }
                    return Ok(AuditReport {
                        subject_id: id.clone(),
                        views: truth.views,
                        downloads: truth.downloads,
                        likes: truth.likes,
                        corrected,
                        before,
                        synced_at,
                    });
                }
                Err(StoreError::Conflict(_)) if attempt < CAS_ATTEMPTS => {
                    debug!(attempt, "projection changed during audit, recounting");
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(AuditError::Contended {
                        subject: id.clone(),
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Audit one page of subjects, ordered by id, strictly after `cursor`.
    ///
    /// Per-subject failures are logged and counted; the call only fails when
    /// listing fails or more than half of a non-empty page errored.
    #[instrument(skip(self, cursor), fields(cursor = ?cursor.map(SubjectId::as_str)))]
    pub async fn audit_all(
        &self,
        batch_size: Option<usize>,
        cursor: Option<&SubjectId>,
    ) -> Result<AuditSummary, AuditError> {
        let size = batch_size
            .unwrap_or(self.default_batch_size)
            .clamp(1, MAX_BATCH_SIZE);
        let ids = self.store.list_subject_ids(cursor, size).await?;

        let mut summary = AuditSummary::default();
        for id in &ids {
            match self.audit_subject(id).await {
                Ok(report) => {
                    summary.checked += 1;
                    if report.corrected {
                        summary.corrected += 1;
                    }
                }
                Err(AuditError::SubjectNotFound(_)) => {
                    warn!(subject_id = %id, "subject vanished during audit, skipping");
                    summary.skipped += 1;
                }
                Err(e) => {
                    warn!(subject_id = %id, error = %e, "subject audit failed");
                    summary.errors += 1;
                }
            }
        }

        summary.next_cursor = if ids.len() == size { ids.last().cloned() } else { None };

        let attempted = ids.len() as u64;
        if attempted > 0 && summary.errors * 2 > attempted {
            return Err(AuditError::BatchFailed {
                failed: summary.errors,
                attempted,
                summary,
            });
        }

        info!(
            checked = summary.checked,
            corrected = summary.corrected,
            skipped = summary.skipped,
            errors = summary.errors,
            "audit page finished"
        );
        Ok(summary)
    }

    /// Audit every subject, page by page.
    pub async fn audit_everything(&self) -> Result<AuditSummary, AuditError> {
        let mut total = AuditSummary::default();
        let mut cursor: Option<SubjectId> = None;
        loop {
            let page = self.audit_all(None, cursor.as_ref()).await?;
            total.absorb(&page);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::config::CacheConfig;
    use crate::store::InMemoryStore;
    use glyphmart_core::{ActorId, ActorKey, InteractionKey, Subject};

    fn sid(id: &str) -> SubjectId {
        SubjectId::parse(id).unwrap()
    }

    fn key(subject: &str, actor: &str, kind: InteractionKind) -> InteractionKey {
        InteractionKey::new(sid(subject), ActorKey::parse(actor).unwrap(), kind)
    }

    async fn seeded(ids: &[&str]) -> (Arc<InMemoryStore>, Arc<ReadCache>, DriftAuditor<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        for id in ids {
            let s = Subject::new(sid(id), ActorId::parse("owner").unwrap(), "g", Utc::now()).unwrap();
            store.put_subject(&s).await.unwrap();
        }
        let cache = Arc::new(ReadCache::init(CacheConfig::default()));
        let auditor = DriftAuditor::new(store.clone(), cache.clone(), 50);
        (store, cache, auditor)
    }

    #[tokio::test]
    async fn consistent_subject_is_not_corrected_but_is_stamped() {
        let (store, _, auditor) = seeded(&["S1"]).await;
        for actor in ["U1", "U2"] {
            store
                .record_if_absent(&key("S1", actor, InteractionKind::View), Utc::now())
                .await
                .unwrap();
        }

        let report = auditor.audit_subject(&sid("S1")).await.unwrap();
        assert_eq!((report.views, report.corrected), (2, false));
        let stored = store.get_subject(&sid("S1")).await.unwrap().unwrap();
        assert_eq!(stored.last_count_sync, Some(report.synced_at));
    }

    #[tokio::test]
    async fn manual_corruption_is_overwritten_with_ledger_totals() {
        let (store, cache, auditor) = seeded(&["S2"]).await;
        for actor in ["a", "b", "c"] {
            store
                .record_if_absent(&key("S2", actor, InteractionKind::Download), Utc::now())
                .await
                .unwrap();
        }
        store.force_counters(&sid("S2"), Counters::new(0, 999, 0)).unwrap();
        cache.put(&CacheKey::subject(&sid("S2")), &"stale").unwrap();
        cache.put(&CacheKey::popular(20), &"stale").unwrap();

        let report = auditor.audit_subject(&sid("S2")).await.unwrap();
        assert_eq!((report.downloads, report.corrected), (3, true));
        assert_eq!(report.before.downloads, 999);
        assert_eq!(store.get_subject(&sid("S2")).await.unwrap().unwrap().counters.downloads, 3);
        assert_eq!(cache.get::<String>(&CacheKey::subject(&sid("S2"))), None);
        assert_eq!(cache.get::<String>(&CacheKey::popular(20)), None);

        // Idempotent re-run.
        let again = auditor.audit_subject(&sid("S2")).await.unwrap();
        assert_eq!((again.downloads, again.corrected), (3, false));
    }

    #[tokio::test]
    async fn unprojected_events_are_picked_up() {
        let (store, _, auditor) = seeded(&["S1"]).await;
        store
            .insert_event_unprojected(&key("S1", "U1", InteractionKind::Like), Utc::now())
            .unwrap();

        let report = auditor.audit_subject(&sid("S1")).await.unwrap();
        assert_eq!(report.counters(), Counters::new(0, 0, 1));
        assert!(report.corrected);
    }

    #[tokio::test]
    async fn subject_without_events_reads_zero() {
        let (store, _, auditor) = seeded(&["S3"]).await;
        store.force_counters(&sid("S3"), Counters::new(4, 5, 6)).unwrap();
        let report = auditor.audit_subject(&sid("S3")).await.unwrap();
        assert_eq!(report.counters(), Counters::default());
    }

    #[tokio::test]
    async fn missing_subject_is_not_found() {
        let (_, _, auditor) = seeded(&[]).await;
        assert_eq!(
            auditor.audit_subject(&sid("ghost")).await,
            Err(AuditError::SubjectNotFound(sid("ghost")))
        );
    }

    #[tokio::test]
    async fn pages_resume_from_cursor() {
        let (store, _, auditor) = seeded(&["a", "b", "c", "d", "e"]).await;
        store.force_counters(&sid("b"), Counters::new(1, 0, 0)).unwrap();
        store.force_counters(&sid("e"), Counters::new(0, 1, 0)).unwrap();

        let first = auditor.audit_all(Some(2), None).await.unwrap();
        assert_eq!((first.checked, first.corrected), (2, 1));
        assert_eq!(first.next_cursor, Some(sid("b")));

        let second = auditor.audit_all(Some(2), first.next_cursor.as_ref()).await.unwrap();
        assert_eq!(second.next_cursor, Some(sid("d")));
        let third = auditor.audit_all(Some(2), second.next_cursor.as_ref()).await.unwrap();
        assert_eq!((third.checked, third.corrected, third.next_cursor), (1, 1, None));

        let total = auditor.audit_everything().await.unwrap();
        assert_eq!((total.checked, total.corrected), (5, 0));
    }

    #[tokio::test]
    async fn zero_batch_size_is_clamped() {
        let (_, _, auditor) = seeded(&["a", "b"]).await;
        let page = auditor.audit_all(Some(0), None).await.unwrap();
        assert_eq!(page.checked, 1);
        assert_eq!(page.next_cursor, Some(sid("a")));
    }

    #[tokio::test]
    async fn majority_failure_fails_the_batch() {
        let (store, _, auditor) = seeded(&["a", "b", "c"]).await;
        store.fail_reads_of(&sid("a"));

        // One failure out of three is tolerated.
        let page = auditor.audit_all(Some(10), None).await.unwrap();
        assert_eq!((page.checked, page.errors), (2, 1));

        store.fail_reads_of(&sid("b"));
        match auditor.audit_all(Some(10), None).await {
            Err(AuditError::BatchFailed { failed, attempted, summary }) => {
                assert_eq!((failed, attempted), (2, 3));
                assert_eq!(summary.checked, 1);
            }
            other => panic!("expected batch failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflicting_writes_trigger_a_recount() {
        let (store, _, auditor) = seeded(&["S1"]).await;
        store
            .record_if_absent(&key("S1", "U1", InteractionKind::View), Utc::now())
            .await
            .unwrap();
        store.force_counters(&sid("S1"), Counters::new(5, 0, 0)).unwrap();

        store.force_conflicts(CAS_ATTEMPTS - 1);
        let report = auditor.audit_subject(&sid("S1")).await.unwrap();
        assert_eq!((report.views, report.corrected), (1, true));
        assert_eq!(store.get_subject(&sid("S1")).await.unwrap().unwrap().counters.views, 1);
    }

    #[tokio::test]
    async fn persistent_conflicts_give_up_as_contended() {
        let (store, _, auditor) = seeded(&["S1"]).await;
        store.force_counters(&sid("S1"), Counters::new(5, 0, 0)).unwrap();

        store.force_conflicts(CAS_ATTEMPTS);
        assert_eq!(
            auditor.audit_subject(&sid("S1")).await,
            Err(AuditError::Contended {
                subject: sid("S1"),
                attempts: CAS_ATTEMPTS,
            })
        );
        let stored = store.get_subject(&sid("S1")).await.unwrap().unwrap();
        assert_eq!(stored.counters.views, 5);
        assert_eq!(stored.last_count_sync, None);

        // Contention is transient: the next audit repairs the projection.
        assert!(auditor.audit_subject(&sid("S1")).await.unwrap().corrected);
    }

    #[tokio::test]
    async fn listing_failure_is_a_store_error() {
        let (store, _, auditor) = seeded(&["a"]).await;
        store.inject_failures(1);
        assert!(matches!(auditor.audit_all(None, None).await, Err(AuditError::Store(_))));
    }
}

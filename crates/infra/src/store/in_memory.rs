use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use glyphmart_core::{ActorKey, Counters, InteractionEvent, InteractionKey, InteractionKind, Subject, SubjectId};

use super::r#trait::{EventLedger, StoreError, StoreStats, SubjectStore, ToggleOutcome};

#[derive(Debug, Default)]
struct State {
    subjects: BTreeMap<SubjectId, Subject>,
    /// Per-kind collections keyed by the composite document id.
    ledger: HashMap<InteractionKind, BTreeMap<String, InteractionEvent>>,
}

impl State {
    fn collection(&self, kind: InteractionKind) -> impl Iterator<Item = &InteractionEvent> {
        self.ledger.get(&kind).into_iter().flat_map(|c| c.values())
    }
}

/// In-memory subject store and ledger.
///
/// Intended for tests/dev. A single lock covers subjects and ledger, which
/// makes every event write plus counter delta one atomic unit.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    max_batch_get: Option<usize>,
    injected_failures: AtomicU32,
    lost_acks: AtomicU32,
    forced_conflicts: AtomicU32,
    read_delay_ms: AtomicU64,
    unreadable: RwLock<HashSet<SubjectId>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulate a document store with a multi-get size limit.
    pub fn with_max_batch_get(mut self, max: usize) -> Self {
        self.max_batch_get = Some(max.max(1));
        self
    }

    /// Fail the next `n` store calls with `Unavailable`.
    #[doc(hidden)]
    pub fn inject_failures(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` ledger writes, then report them as timed out.
    #[doc(hidden)]
    pub fn lose_write_acks(&self, n: u32) {
        self.lost_acks.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` counter replacements with `Conflict`.
    #[doc(hidden)]
    pub fn force_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Hold every point read for `delay` after the value was read.
    #[doc(hidden)]
    pub fn delay_reads(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every point read of `id` fail with `Unavailable`.
    #[doc(hidden)]
    pub fn fail_reads_of(&self, id: &SubjectId) {
        if let Ok(mut ids) = self.unreadable.write() {
            ids.insert(id.clone());
        }
    }

    /// Overwrite the projection without touching the ledger (manual data edit).
    #[doc(hidden)]
    pub fn force_counters(&self, id: &SubjectId, counters: Counters) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let subject = state
            .subjects
            .get_mut(id)
            .ok_or_else(|| StoreError::SubjectNotFound(id.clone()))?;
        subject.counters = counters;
        Ok(())
    }

    /// Write an event without its counter delta (crash between the two writes).
    #[doc(hidden)]
    pub fn insert_event_unprojected(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state
            .ledger
            .entry(key.kind)
            .or_default()
            .insert(key.document_id(), InteractionEvent::new(key.clone(), at));
        Ok(())
    }

    fn check_injected(&self) -> Result<(), StoreError> {
        if take_one(&self.injected_failures) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn acknowledge<T>(&self, applied: T) -> Result<T, StoreError> {
        if take_one(&self.lost_acks) {
            return Err(StoreError::Timeout(Duration::ZERO));
        }
        Ok(applied)
    }

    fn insert_if_absent(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        if !state.subjects.contains_key(&key.subject) {
            return Err(StoreError::SubjectNotFound(key.subject.clone()));
        }

        let doc_id = key.document_id();
        let collection = state.ledger.entry(key.kind).or_default();
        if collection.contains_key(&doc_id) {
            return Ok(false);
        }
        collection.insert(doc_id, InteractionEvent::new(key.clone(), at));

        if let Some(subject) = state.subjects.get_mut(&key.subject) {
            subject.counters.apply_delta(key.kind, 1);
        }
        Ok(true)
    }

    fn flip(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<ToggleOutcome, StoreError> {
        let mut state = self.write()?;
        if !state.subjects.contains_key(&key.subject) {
            return Err(StoreError::SubjectNotFound(key.subject.clone()));
        }

        let doc_id = key.document_id();
        let collection = state.ledger.entry(key.kind).or_default();
        let (present, delta) = if collection.remove(&doc_id).is_some() {
            (false, -1)
        } else {
            collection.insert(doc_id, InteractionEvent::new(key.clone(), at));
            (true, 1)
        };

        let subject = state
            .subjects
            .get_mut(&key.subject)
            .ok_or_else(|| StoreError::SubjectNotFound(key.subject.clone()))?;
        let total = subject.counters.apply_delta(key.kind, delta);
        Ok(ToggleOutcome { present, total })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.check_injected()?;
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.check_injected()?;
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait]
impl SubjectStore for InMemoryStore {
    async fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        if self.unreadable.read().is_ok_and(|ids| ids.contains(id)) {
            return Err(StoreError::Unavailable(format!("{id} is unreadable")));
        }
        let subject = self.read()?.subjects.get(id).cloned();
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(subject)
    }

    async fn get_subjects(&self, ids: &[SubjectId]) -> Result<Vec<Subject>, StoreError> {
        if let Some(max) = self.max_batch_get {
            if ids.len() > max {
                return Err(StoreError::Unavailable(format!(
                    "multi-get of {} ids exceeds limit {max}",
                    ids.len()
                )));
            }
        }
        let state = self.read()?;
        Ok(ids.iter().filter_map(|id| state.subjects.get(id).cloned()).collect())
    }

    fn max_batch_get(&self) -> Option<usize> {
        self.max_batch_get
    }

    async fn list_subject_ids(
        &self,
        after: Option<&SubjectId>,
        limit: usize,
    ) -> Result<Vec<SubjectId>, StoreError> {
        let state = self.read()?;
        let lower = match after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };
        Ok(state
            .subjects
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn put_subject(&self, subject: &Subject) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.subjects.get_mut(&subject.id) {
            Some(existing) => {
                existing.owner = subject.owner.clone();
                existing.title = subject.title.clone();
            }
            None => {
                let mut fresh = subject.clone();
                fresh.counters = Counters::default();
                fresh.last_count_sync = None;
                state.subjects.insert(fresh.id.clone(), fresh);
            }
        }
        Ok(())
    }

    async fn delete_subject(&self, id: &SubjectId) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let existed = state.subjects.remove(id).is_some();
        for collection in state.ledger.values_mut() {
            collection.retain(|_, event| &event.key.subject != id);
        }
        Ok(existed)
    }

    async fn replace_counters(
        &self,
        id: &SubjectId,
        observed: Counters,
        new: Counters,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let subject = state
            .subjects
            .get_mut(id)
            .ok_or_else(|| StoreError::SubjectNotFound(id.clone()))?;
        if take_one(&self.forced_conflicts) {
            return Err(StoreError::Conflict(format!("{id} was written concurrently")));
        }
        if subject.counters != observed {
            return Err(StoreError::Conflict(format!(
                "counters of {id} changed since they were read"
            )));
        }
        subject.counters = new;
        subject.last_count_sync = Some(synced_at);
        Ok(())
    }

    async fn top_subjects(&self, kind: InteractionKind, limit: usize) -> Result<Vec<Subject>, StoreError> {
        let state = self.read()?;
        let mut all: Vec<Subject> = state.subjects.values().cloned().collect();
        all.sort_by(|a, b| {
            b.counters
                .get(kind)
                .cmp(&a.counters.get(kind))
                .then_with(|| a.id.cmp(&b.id))
        });
        all.truncate(limit);
        Ok(all)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.read()?;
        let mut events = Counters::default();
        for kind in InteractionKind::ALL {
            events.set(kind, state.ledger.get(&kind).map_or(0, |c| c.len() as u64));
        }
        Ok(StoreStats {
            subjects: state.subjects.len() as u64,
            events,
        })
    }
}

#[async_trait]
impl EventLedger for InMemoryStore {
    async fn record_if_absent(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let created = self.insert_if_absent(key, at)?;
        self.acknowledge(created)
    }

    async fn toggle(&self, key: &InteractionKey, at: DateTime<Utc>) -> Result<ToggleOutcome, StoreError> {
        let outcome = self.flip(key, at)?;
        self.acknowledge(outcome)
    }

    async fn contains(&self, key: &InteractionKey) -> Result<bool, StoreError> {
        let state = self.read()?;
        Ok(state
            .ledger
            .get(&key.kind)
            .is_some_and(|c| c.contains_key(&key.document_id())))
    }

    async fn count(&self, subject: &SubjectId, kind: InteractionKind) -> Result<u64, StoreError> {
        let state = self.read()?;
        Ok(state.collection(kind).filter(|e| &e.key.subject == subject).count() as u64)
    }

    async fn subjects_for_actor(&self, actor: &ActorKey, kind: InteractionKind) -> Result<Vec<SubjectId>, StoreError> {
        let state = self.read()?;
        Ok(state
            .collection(kind)
            .filter(|e| &e.key.actor == actor)
            .map(|e| e.key.subject.clone())
            .collect())
    }
}

fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

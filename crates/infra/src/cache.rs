//! Process-local read cache with per-class TTLs.
//!
//! Entries move `ABSENT -> FRESH -> STALE -> ABSENT`. `get` only ever returns
//! fresh values; stale entries are retained for `stale_retention` so that
//! [`ReadCache::get_or_load`] can serve them when a reload fails.
//!
//! The cache is never a source of truth: each instance is independent and
//! invalidation is best-effort within this process.
//!
//! Every invalidation bumps a generation counter under the entries lock. A
//! value read from the store before an invalidation must not be written back
//! after it, so loaders capture [`ReadCache::generation`] first and store
//! through [`ReadCache::put_if_unchanged`].

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use glyphmart_core::{ActorId, SubjectId};

use crate::config::{CacheConfig, TtlConfig};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache value for '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Data class of a cache entry; selects TTL and invalidation group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheClass {
    Counts,
    Subject,
    Profile,
    AdminStats,
    Popular,
}

impl CacheClass {
    pub const ALL: [CacheClass; 5] = [
        CacheClass::Counts,
        CacheClass::Subject,
        CacheClass::Profile,
        CacheClass::AdminStats,
        CacheClass::Popular,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheClass::Counts => "counts",
            CacheClass::Subject => "subject",
            CacheClass::Profile => "profile",
            CacheClass::AdminStats => "admin_stats",
            CacheClass::Popular => "popular",
        }
    }

    /// Key prefix shared by every entry of this class.
    pub fn prefix(self) -> String {
        format!("{}:", self.as_str())
    }

    pub fn ttl(self, ttl: &TtlConfig) -> Duration {
        match self {
            CacheClass::Counts => ttl.counts,
            CacheClass::Subject => ttl.subject,
            CacheClass::Profile => ttl.profile,
            CacheClass::AdminStats => ttl.admin_stats,
            CacheClass::Popular => ttl.popular,
        }
    }
}

/// A cache key of the form `"{class}:{id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    class: CacheClass,
    key: String,
}

impl CacheKey {
    pub fn new(class: CacheClass, id: impl Display) -> Self {
        Self {
            class,
            key: format!("{}:{id}", class.as_str()),
        }
    }

    pub fn counts(id: &SubjectId) -> Self {
        Self::new(CacheClass::Counts, id)
    }

    pub fn subject(id: &SubjectId) -> Self {
        Self::new(CacheClass::Subject, id)
    }

    pub fn liked_by(actor: &ActorId) -> Self {
        Self::new(CacheClass::Profile, format_args!("likes:{actor}"))
    }

    pub fn popular(limit: usize) -> Self {
        Self::new(CacheClass::Popular, limit)
    }

    pub fn admin_stats() -> Self {
        Self::new(CacheClass::AdminStats, "summary")
    }

    pub fn class(&self) -> CacheClass {
        self.class
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Upper bound on TTL and stale retention; keeps `Instant` arithmetic in range.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

enum Slot {
    Fresh(JsonValue, u64),
    Evictable(u64),
    Missing,
}

enum Flight {
    Wait(watch::Receiver<()>),
    Lead(watch::Sender<()>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    class: CacheClass,
    stamp: u64,
    expires_at: Instant,
    evict_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    fn is_evictable(&self, now: Instant) -> bool {
        now >= self.evict_at
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    stale_served: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of cache state and counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
    pub by_class: BTreeMap<&'static str, usize>,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub stale_served: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

/// TTL read cache, injected into services (never an ambient singleton).
#[derive(Debug)]
pub struct ReadCache {
    config: CacheConfig,
    enabled: AtomicBool,
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<()>>>,
    // Bumped only while the entries write lock is held.
    generation: AtomicU64,
    next_stamp: AtomicU64,
    counters: CacheCounters,
}

/// Removes the in-flight marker when the leading load finishes; dropping
/// the sender wakes every waiter.
struct FlightGuard<'a> {
    cache: &'a ReadCache,
    key: String,
    _done: watch::Sender<()>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.cache.flights().remove(&self.key);
    }
}

impl ReadCache {
    /// Start a cache with the given configuration.
    pub fn init(config: CacheConfig) -> Self {
        let enabled = config.enabled;
        debug!(enabled, "read cache initialised");
        Self {
            config,
            enabled: AtomicBool::new(enabled),
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            next_stamp: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    /// A pass-through cache: every read misses and nothing is stored.
    pub fn disabled() -> Self {
        Self::init(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    /// Drop all entries and turn this instance into a pass-through.
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let dropped = {
            let mut entries = self.write_entries();
            self.generation.fetch_add(1, Ordering::SeqCst);
            let n = entries.len();
            entries.clear();
            n
        };
        debug!(dropped, "read cache shut down");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        class.ttl(&self.config.ttl)
    }

    /// Fresh value for `key`, if any.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        let now = Instant::now();
        let slot = match self.read_entries().get(key.as_str()) {
            Some(entry) if entry.is_fresh(now) => Slot::Fresh(entry.value.clone(), entry.stamp),
            Some(entry) if entry.is_evictable(now) => Slot::Evictable(entry.stamp),
            _ => Slot::Missing,
        };

        let decoded = match slot {
            Slot::Fresh(value, stamp) => match serde_json::from_value(value) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping undecodable cache entry");
                    self.remove_stamped(key, stamp);
                    None
                }
            },
            Slot::Evictable(stamp) => {
                self.remove_stamped(key, stamp);
                None
            }
            Slot::Missing => None,
        };

        if decoded.is_some() {
            CacheCounters::bump(&self.counters.hits);
        } else {
            CacheCounters::bump(&self.counters.misses);
        }
        decoded
    }

    /// Write-through with the class TTL.
    pub fn put<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
        self.put_with_ttl(key, value, self.ttl_for(key.class()))
    }

    pub fn put_with_ttl<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let entry = self.entry(key, value, ttl)?;
        self.write_entries().insert(key.as_str().to_string(), entry);
        Ok(())
    }

    /// Current invalidation generation. Capture it before reading the store.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store `value` only if nothing was invalidated since `generation` was
    /// captured. Returns whether the value was stored.
    pub fn put_if_unchanged<T: Serialize>(&self, key: &CacheKey, value: &T, generation: u64) -> Result<bool, CacheError> {
        self.put_with_ttl_if_unchanged(key, value, self.ttl_for(key.class()), generation)
    }

    fn put_with_ttl_if_unchanged<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let entry = self.entry(key, value, ttl)?;
        let mut entries = self.write_entries();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(key = %key, "invalidated during load, not caching");
            return Ok(false);
        }
        entries.insert(key.as_str().to_string(), entry);
        Ok(true)
    }

    fn entry<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<CacheEntry, CacheError> {
        let value = serde_json::to_value(value).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        let expires_at = Instant::now() + ttl.min(MAX_TTL);
        Ok(CacheEntry {
            value,
            class: key.class(),
            stamp: self.next_stamp.fetch_add(1, Ordering::Relaxed),
            expires_at,
            evict_at: expires_at + self.config.stale_retention.min(MAX_TTL),
        })
    }

    /// Cached value, or the result of `loader` (stored with the class TTL).
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &CacheKey, loader: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.get_or_load_with_ttl(key, self.ttl_for(key.class()), loader)
            .await
    }

    /// Like [`ReadCache::get_or_load`] with an explicit TTL.
    ///
    /// Concurrent misses on one key share a single in-flight load. If the
    /// load fails, a stale value (if still retained) is returned instead of
    /// the error.
    pub async fn get_or_load_with_ttl<T, E, F, Fut>(&self, key: &CacheKey, ttl: Duration, loader: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if !self.is_enabled() {
            return loader().await;
        }

        loop {
            if let Some(value) = self.get(key) {
                return Ok(value);
            }

            let flight = {
                let mut flights = self.flights();
                // Re-check under the flight lock: a leader stores its value
                // before it clears its marker.
                if let Some(value) = self.peek_fresh(key) {
                    return Ok(value);
                }
                match flights.get(key.as_str()) {
                    Some(rx) => Flight::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(());
                        flights.insert(key.as_str().to_string(), rx);
                        Flight::Lead(tx)
                    }
                }
            };

            match flight {
                Flight::Wait(mut rx) => {
                    // Resolves when the leader drops its sender.
                    let _ = rx.changed().await;
                    continue;
                }
                Flight::Lead(tx) => {
                    let _guard = FlightGuard {
                        cache: self,
                        key: key.as_str().to_string(),
                        _done: tx,
                    };
                    CacheCounters::bump(&self.counters.loads);
                    let generation = self.generation();
                    return match loader().await {
                        Ok(value) => {
                            if let Err(e) = self.put_with_ttl_if_unchanged(key, &value, ttl, generation) {
                                warn!(error = %e, "loaded value not cached");
                            }
                            Ok(value)
                        }
                        Err(err) => {
                            CacheCounters::bump(&self.counters.load_failures);
                            match self.peek_stale(key) {
                                Some(stale) => {
                                    warn!(key = %key, error = %err, "load failed, serving stale value");
                                    CacheCounters::bump(&self.counters.stale_served);
                                    Ok(stale)
                                }
                                None => Err(err),
                            }
                        }
                    };
                }
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut entries = self.write_entries();
            self.generation.fetch_add(1, Ordering::SeqCst);
            entries.remove(key.as_str()).is_some()
        };
        if removed {
            CacheCounters::bump(&self.counters.invalidations);
            debug!(key = %key, "cache entry invalidated");
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = {
            let mut entries = self.write_entries();
            self.generation.fetch_add(1, Ordering::SeqCst);
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(prefix));
            before - entries.len()
        };
        if removed > 0 {
            self.counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(prefix, removed, "cache group invalidated");
        }
        removed
    }

    pub fn invalidate_class(&self, class: CacheClass) -> usize {
        self.invalidate_prefix(&class.prefix())
    }

    /// Drop the per-subject entries (`subject:` and `counts:`).
    pub fn invalidate_subject(&self, id: &SubjectId) {
        self.invalidate(&CacheKey::subject(id));
        self.invalidate(&CacheKey::counts(id));
    }

    /// Drop aggregate views that rank or total subjects.
    pub fn invalidate_rankings(&self) {
        self.invalidate_class(CacheClass::Popular);
        self.invalidate_class(CacheClass::AdminStats);
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut entries = self.write_entries();
            self.generation.fetch_add(1, Ordering::SeqCst);
            let n = entries.len();
            entries.clear();
            n
        };
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop entries past their stale-retention window.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|_, e| !e.is_evictable(now));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut stats = CacheStats {
            enabled: self.is_enabled(),
            by_class: CacheClass::ALL.iter().map(|c| (c.as_str(), 0)).collect(),
            ..CacheStats::default()
        };
        {
            let entries = self.read_entries();
            for entry in entries.values() {
                stats.entries += 1;
                if entry.is_fresh(now) {
                    stats.fresh += 1;
                } else {
                    stats.stale += 1;
                }
                *stats.by_class.entry(entry.class.as_str()).or_default() += 1;
            }
        }
        stats.hits = self.counters.hits.load(Ordering::Relaxed);
        stats.misses = self.counters.misses.load(Ordering::Relaxed);
        stats.loads = self.counters.loads.load(Ordering::Relaxed);
        stats.load_failures = self.counters.load_failures.load(Ordering::Relaxed);
        stats.stale_served = self.counters.stale_served.load(Ordering::Relaxed);
        stats.invalidations = self.counters.invalidations.load(Ordering::Relaxed);
        let lookups = stats.hits + stats.misses;
        stats.hit_rate = if lookups == 0 {
            0.0
        } else {
            stats.hits as f64 / lookups as f64
        };
        stats
    }

    // A concurrent put replaces the entry with a new stamp; leave that one.
    fn remove_stamped(&self, key: &CacheKey, stamp: u64) {
        let mut entries = self.write_entries();
        if entries.get(key.as_str()).is_some_and(|e| e.stamp == stamp) {
            entries.remove(key.as_str());
        }
    }

    fn peek_fresh<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        let entries = self.read_entries();
        entries
            .get(key.as_str())
            .filter(|e| e.is_fresh(now))
            .and_then(|e| serde_json::from_value(e.value.clone()).ok())
    }

    fn peek_stale<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        let entries = self.read_entries();
        entries
            .get(key.as_str())
            .filter(|e| !e.is_evictable(now))
            .and_then(|e| serde_json::from_value(e.value.clone()).ok())
    }

    // The maps hold plain data, so a poisoned lock is still consistent.
    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<()>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::audit::DriftAuditor;
use crate::retry::RetryPolicy;
use crate::store::Store;

/// Config for the periodic drift audit.
#[derive(Debug, Clone)]
pub struct AuditScheduler {
    pub interval: Duration,
    /// Backoff applied after consecutive failed passes.
    pub backoff: RetryPolicy,
}

impl AuditScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            backoff: RetryPolicy {
                base_delay: Duration::from_millis(250),
                max_delay: interval.max(Duration::from_millis(250)),
                ..RetryPolicy::default()
            },
        }
    }

    /// Spawn the audit loop on the current runtime.
    ///
    /// Runs once on startup, then every `interval`. `trigger()` requests an
    /// extra pass. Failed passes are logged and never stop the loop.
    pub fn spawn<S>(&self, auditor: Arc<DriftAuditor<S>>) -> AuditSchedulerHandle
    where
        S: Store + ?Sized + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
        let passes = Arc::new(AtomicU64::new(0));

        let join = tokio::spawn(audit_loop(
            self.clone(),
            auditor,
            shutdown_rx,
            trigger_rx,
            passes.clone(),
        ));

        AuditSchedulerHandle {
            shutdown: Some(shutdown_tx),
            trigger: trigger_tx,
            join: Some(join),
            passes,
        }
    }
}

/// Handle for the running audit loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct AuditSchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    trigger: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
}

impl AuditSchedulerHandle {
    /// Request an audit pass. Coalesced: a no-op while one is already pending.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Passes finished so far, successful or not.
    pub fn completed_passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Stop the loop and wait for an in-progress pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "audit scheduler task ended abnormally");
            }
        }
    }
}

async fn audit_loop<S>(
    cfg: AuditScheduler,
    auditor: Arc<DriftAuditor<S>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut trigger_rx: mpsc::Receiver<()>,
    passes: Arc<AtomicU64>,
) where
    S: Store + ?Sized + 'static,
{
    info!(interval_secs = cfg.interval.as_secs(), "audit scheduler started");

    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {}
            Some(()) = trigger_rx.recv() => {}
        }

        let started = Instant::now();
        match auditor.audit_everything().await {
            Ok(summary) => {
                failures = 0;
                info!(
                    checked = summary.checked,
                    corrected = summary.corrected,
                    skipped = summary.skipped,
                    errors = summary.errors,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "audit pass finished"
                );
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = cfg.backoff.delay_for_attempt(failures);
                warn!(error = %e, failures, backoff_ms = delay.as_millis() as u64, "audit pass failed");
                passes.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        }
        passes.fetch_add(1, Ordering::SeqCst);
    }

    info!("audit scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReadCache;
    use crate::config::CacheConfig;
    use crate::store::{InMemoryStore, SubjectStore};
    use chrono::Utc;
    use glyphmart_core::{ActorId, Counters, Subject, SubjectId};

    async fn wait_for_passes(handle: &AuditSchedulerHandle, n: u64) {
        for _ in 0..200 {
            if handle.completed_passes() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduler did not reach {n} passes");
    }

    #[tokio::test]
    async fn runs_on_startup_and_on_trigger() {
        let store = Arc::new(InMemoryStore::new());
        let id = SubjectId::parse("S1").unwrap();
        let s = Subject::new(id.clone(), ActorId::parse("o").unwrap(), "t", Utc::now()).unwrap();
        store.put_subject(&s).await.unwrap();
        store.force_counters(&id, Counters::new(7, 0, 0)).unwrap();

        let cache = Arc::new(ReadCache::init(CacheConfig::default()));
        let auditor = Arc::new(DriftAuditor::new(store.clone(), cache, 10));
        let handle = AuditScheduler::new(Duration::from_secs(3600)).spawn(auditor);

        wait_for_passes(&handle, 1).await;
        assert_eq!(store.get_subject(&id).await.unwrap().unwrap().counters, Counters::default());

        store.force_counters(&id, Counters::new(0, 2, 0)).unwrap();
        handle.trigger();
        wait_for_passes(&handle, 2).await;
        assert_eq!(store.get_subject(&id).await.unwrap().unwrap().counters, Counters::default());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_pass_does_not_stop_the_loop() {
        let store = Arc::new(InMemoryStore::new());
        store.inject_failures(1);
        let cache = Arc::new(ReadCache::init(CacheConfig::default()));
        let auditor = Arc::new(DriftAuditor::new(store, cache, 10));

        let mut cfg = AuditScheduler::new(Duration::from_secs(3600));
        cfg.backoff = RetryPolicy::exponential(1, Duration::from_millis(1));
        let handle = cfg.spawn(auditor);

        wait_for_passes(&handle, 1).await;
        handle.trigger();
        wait_for_passes(&handle, 2).await;
        handle.shutdown().await;
    }
}

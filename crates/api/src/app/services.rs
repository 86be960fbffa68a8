//! Infrastructure wiring shared by all handlers.

use std::sync::Arc;
use std::time::Duration;

use glyphmart_auth::AdminPolicy;
use glyphmart_infra::{
    AuditScheduler, AuditSchedulerHandle, DriftAuditor, InteractionService, ReadCache, ServiceConfig, Store,
    StoreError, SubjectQueries, open_store,
};

pub struct AppServices {
    pub store: Arc<dyn Store>,
    pub cache: Arc<ReadCache>,
    pub interactions: InteractionService<dyn Store>,
    pub queries: SubjectQueries<dyn Store>,
    pub auditor: Arc<DriftAuditor<dyn Store>>,
    pub admins: Arc<AdminPolicy>,
}

impl AppServices {
    pub fn new(store: Arc<dyn Store>, config: &ServiceConfig, admins: AdminPolicy) -> Self {
        let cache = Arc::new(if config.cache.enabled {
            ReadCache::init(config.cache.clone())
        } else {
            ReadCache::disabled()
        });

        Self {
            interactions: InteractionService::new(store.clone(), cache.clone(), config.store.retry.clone()),
            queries: SubjectQueries::new(store.clone(), cache.clone(), config.store.max_batch_get),
            auditor: Arc::new(DriftAuditor::new(store.clone(), cache.clone(), config.audit.batch_size)),
            admins: Arc::new(admins),
            store,
            cache,
        }
    }

    /// Start the periodic drift audit.
    pub fn spawn_audit_scheduler(&self, interval: Duration) -> AuditSchedulerHandle {
        AuditScheduler::new(interval).spawn(self.auditor.clone())
    }

    /// Drop cached state on process shutdown.
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}

pub async fn build_services(config: &ServiceConfig, admins: AdminPolicy) -> Result<AppServices, StoreError> {
    let store = open_store(&config.store).await?;
    Ok(AppServices::new(store, config, admins))
}

//! Infrastructure layer: stores, cache, interaction recording, drift audit.

pub mod audit;
pub mod batch;
pub mod cache;
pub mod config;
pub mod interactions;
pub mod queries;
pub mod retry;
pub mod scheduler;
pub mod store;


pub use audit::{AuditError, AuditReport, AuditSummary, DriftAuditor};
pub use batch::{BatchError, BatchFetcher, Lookup};
pub use cache::{CacheClass, CacheError, CacheKey, CacheStats, ReadCache};
pub use config::{AuditConfig, CacheConfig, ConfigError, ServiceConfig, StoreConfig, TtlConfig};
pub use interactions::{InteractionError, InteractionService, LikeToggle, Recorded};
pub use queries::{AdminStats, QueryError, SubjectQueries};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{AuditScheduler, AuditSchedulerHandle};
pub use store::{EventLedger, InMemoryStore, PostgresStore, Store, StoreError, SubjectStore, TimedStore, open_store};

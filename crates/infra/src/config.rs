//! Service configuration loaded from the environment.
//!
//! Every knob has a default; a present-but-unparsable value is a
//! [`ConfigError`] rather than a silent fallback.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("{0} must be set")]
    Missing(String),
}

/// Time-to-live per cache data class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlConfig {
    /// Per-subject counters (changes often).
    pub counts: Duration,
    /// Full subject records.
    pub subject: Duration,
    /// Per-actor profile data such as liked subjects (changes rarely).
    pub profile: Duration,
    /// Aggregate dashboard statistics.
    pub admin_stats: Duration,
    /// Popular list.
    pub popular: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            counts: Duration::from_secs(300),
            subject: Duration::from_secs(600),
            profile: Duration::from_secs(1800),
            admin_stats: Duration::from_secs(120),
            popular: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: TtlConfig,
    /// How long an expired entry is kept around for the stale fallback.
    pub stale_retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: TtlConfig::default(),
            stale_retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Use Postgres instead of the in-memory backend.
    pub persistent: bool,
    pub database_url: Option<String>,
    pub timeout: Duration,
    /// Upper bound for one grouped multi-get.
    pub max_batch_get: usize,
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            database_url: None,
            timeout: Duration::from_millis(5000),
            max_batch_get: 10,
            retry: RetryPolicy::exponential(3, Duration::from_millis(50)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    pub batch_size: usize,
    /// Period of the background audit; `None` disables it.
    pub interval: Option<Duration>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            interval: None,
        }
    }
}

/// Everything the infrastructure layer needs at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub audit: AuditConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests use a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServiceConfig::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(match parse::<u64>(&lookup, key)? {
                Some(s) => Duration::from_secs(s),
                None => default,
            })
        };

        let ttl = TtlConfig {
            counts: secs("CACHE_TTL_COUNTS", defaults.cache.ttl.counts)?,
            subject: secs("CACHE_TTL_SUBJECT", defaults.cache.ttl.subject)?,
            profile: secs("CACHE_TTL_PROFILE", defaults.cache.ttl.profile)?,
            admin_stats: secs("CACHE_TTL_ADMIN_STATS", defaults.cache.ttl.admin_stats)?,
            popular: secs("CACHE_TTL_POPULAR", defaults.cache.ttl.popular)?,
        };
        let cache = CacheConfig {
            enabled: parse::<bool>(&lookup, "CACHE_ENABLED")?.unwrap_or(defaults.cache.enabled),
            ttl,
            stale_retention: secs("CACHE_STALE_RETENTION", defaults.cache.stale_retention)?,
        };

        let persistent = parse::<bool>(&lookup, "USE_PERSISTENT_STORES")?.unwrap_or(false);
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if persistent && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL".to_string()));
        }

        let retry_attempts = parse::<u32>(&lookup, "STORE_RETRY_ATTEMPTS")?
            .unwrap_or(defaults.store.retry.max_attempts);
        let retry_base = parse::<u64>(&lookup, "STORE_RETRY_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.store.retry.base_delay);
        let store = StoreConfig {
            persistent,
            database_url,
            timeout: parse::<u64>(&lookup, "STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.store.timeout),
            max_batch_get: positive(
                "STORE_MAX_BATCH_GET",
                parse::<usize>(&lookup, "STORE_MAX_BATCH_GET")?.unwrap_or(defaults.store.max_batch_get),
            )?,
            retry: RetryPolicy::exponential(retry_attempts, retry_base),
        };

        let audit = AuditConfig {
            batch_size: positive(
                "AUDIT_BATCH_SIZE",
                parse::<usize>(&lookup, "AUDIT_BATCH_SIZE")?.unwrap_or(defaults.audit.batch_size),
            )?,
            interval: parse::<u64>(&lookup, "AUDIT_INTERVAL_SECS")?
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        };

        Ok(Self { cache, store, audit })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => {
            debug!("{key} not set, using default");
            Ok(None)
        }
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

fn positive(key: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

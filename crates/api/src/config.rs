//! HTTP-side configuration (bind address, token secret, super-admins).

use std::env;
use std::net::SocketAddr;

use glyphmart_core::ActorId;
use glyphmart_infra::{ConfigError, ServiceConfig};

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: SocketAddr,
    pub jwt_secret: String,
    /// True when `JWT_SECRET` was unset and the dev default is in use.
    pub insecure_secret: bool,
    pub admin_actor_ids: Vec<ActorId>,
    pub service: ServiceConfig,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_bind = lookup("GLYPHMART_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = raw_bind.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            key: "GLYPHMART_BIND".to_string(),
            message: e.to_string(),
        })?;

        let (jwt_secret, insecure_secret) = match lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => (secret, false),
            None => (DEV_JWT_SECRET.to_string(), true),
        };

        let admin_actor_ids = lookup("ADMIN_ACTOR_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                ActorId::parse(s).map_err(|e| ConfigError::Invalid {
                    key: "ADMIN_ACTOR_IDS".to_string(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            bind,
            jwt_secret,
            insecure_secret,
            admin_actor_ids,
            service: ServiceConfig::from_lookup(&lookup)?,
        })
    }

    /// In-memory config for tests and local runs.
    pub fn for_tests(jwt_secret: impl Into<String>) -> Self {
        Self {
            bind: ([127, 0, 0, 1], 0).into(),
            jwt_secret: jwt_secret.into(),
            insecure_secret: false,
            admin_actor_ids: Vec::new(),
            service: ServiceConfig::default(),
        }
    }
}

//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, cache, and service wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use glyphmart_auth::{AdminPolicy, Hs256JwtValidator, IdentityVerifier};
use glyphmart_infra::StoreError;

use crate::config::ApiConfig;
use crate::middleware::{self, AuthState};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// A built application: the router plus the services behind it.
pub struct App {
    pub router: Router,
    pub services: Arc<AppServices>,
}

/// Build the full HTTP application (public entrypoint used by `main.rs`).
pub async fn build_app(config: &ApiConfig) -> Result<App, StoreError> {
    let admins = AdminPolicy::new(config.admin_actor_ids.iter().cloned());
    let services = Arc::new(services::build_services(&config.service, admins).await?);
    let verifier = Arc::new(Hs256JwtValidator::new(config.jwt_secret.as_bytes()));
    Ok(App {
        router: router(services.clone(), verifier),
        services,
    })
}

/// Assemble the router around existing services and an identity verifier.
pub fn router(services: Arc<AppServices>, verifier: Arc<dyn IdentityVerifier>) -> Router {
    let auth_state = AuthState {
        verifier,
        admins: services.admins.clone(),
    };

    let admin = routes::admin::router().layer(axum::middleware::from_fn_with_state(
        auth_state.clone(),
        middleware::admin_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/api", routes::router().nest("/admin", admin))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(services))
                .layer(axum::middleware::from_fn_with_state(
                    auth_state,
                    middleware::auth_middleware,
                )),
        )
}

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use glyphmart_auth::{AdminPolicy, IdentityVerifier};

use crate::app::errors::json_error;
use crate::context::Identity;

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn IdentityVerifier>,
    pub admins: Arc<AdminPolicy>,
}

/// Identify the caller and attach an [`Identity`] to the request.
///
/// Never rejects on its own: public routes ignore the identity, protected
/// handlers take an `ActorContext` which turns a missing/rejected identity
/// into 401.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let identity = match extract_bearer(req.headers()) {
        Bearer::Missing => Identity::Anonymous,
        Bearer::Malformed => Identity::Rejected("malformed Authorization header".to_string()),
        Bearer::Token(token) => match state.verifier.verify(token, Utc::now()) {
            Ok(actor) => Identity::Verified(actor),
            Err(e) => {
                debug!(error = %e, "credential rejected");
                Identity::Rejected(e.to_string())
            }
        },
    };

    req.extensions_mut().insert(identity);
    next.run(req).await
}

/// Gate for admin routes: 401 without a verified actor, 403 for non-admins.
pub async fn admin_middleware(
    State(state): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    match req.extensions().get::<Identity>() {
        Some(Identity::Verified(actor)) if state.admins.is_admin(actor) => next.run(req).await,
        Some(Identity::Verified(actor)) => {
            debug!(actor = %actor.id(), "admin route denied");
            json_error(StatusCode::FORBIDDEN, "forbidden", "admin privileges required")
        }
        Some(Identity::Rejected(reason)) => json_error(StatusCode::UNAUTHORIZED, "unauthenticated", reason.clone()),
        _ => json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "a bearer token is required"),
    }
}

enum Bearer<'a> {
    Missing,
    Malformed,
    Token(&'a str),
}

fn extract_bearer(headers: &HeaderMap) -> Bearer<'_> {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Bearer::Missing;
    };

    let Ok(header) = header.to_str() else {
        return Bearer::Malformed;
    };

    match header.strip_prefix("Bearer ").map(str::trim) {
        Some(token) if !token.is_empty() => Bearer::Token(token),
        _ => Bearer::Malformed,
    }
}

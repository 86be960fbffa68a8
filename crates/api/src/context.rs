use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::Response;

use glyphmart_auth::{VerifiedActor, fingerprint};
use glyphmart_core::ActorKey;

use crate::app::errors::json_error;

/// Outcome of identifying the caller, attached to every request by the auth
/// middleware.
#[derive(Debug, Clone)]
pub enum Identity {
    Anonymous,
    Verified(VerifiedActor),
    /// A credential was presented but rejected.
    Rejected(String),
}

/// Extractor for routes that require a verified actor.
///
/// Rejects with 401 before the handler body runs.
#[derive(Debug, Clone)]
pub struct ActorContext(pub VerifiedActor);

impl ActorContext {
    pub fn actor(&self) -> &VerifiedActor {
        &self.0
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<Identity>() {
            Some(Identity::Verified(actor)) => Ok(ActorContext(actor.clone())),
            Some(Identity::Rejected(reason)) => Err(json_error(StatusCode::UNAUTHORIZED, "unauthenticated", reason.clone())),
            _ => Err(json_error(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "a bearer token is required",
            )),
        }
    }
}

/// Best-effort anonymous origin of the request (views and downloads).
#[derive(Debug, Clone)]
pub struct ClientOrigin(pub ActorKey);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientOrigin
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(ClientOrigin(fingerprint(forwarded, peer)))
    }
}

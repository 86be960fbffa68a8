//! Identity collaborator: credential -> verified actor.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;

use glyphmart_core::{ActorId, ActorKey};

use crate::claims::{JwtClaims, TokenValidationError, validate_claims};
use crate::Role;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was presented.
    #[error("authentication required")]
    Unauthenticated,

    /// A credential was presented but could not be verified.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// An actor whose identity has been verified by an [`IdentityVerifier`].
///
/// Only verifiers in this crate can construct one, so any API that takes a
/// `VerifiedActor` cannot be reached by an unauthenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedActor {
    id: ActorId,
    roles: Vec<Role>,
}

impl VerifiedActor {
    pub(crate) fn new(id: ActorId, roles: Vec<Role>) -> Self {
        Self { id, roles }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Ledger key for interactions that require a verified identity.
    pub fn actor_key(&self) -> ActorKey {
        ActorKey::verified(&self.id)
    }
}

/// Verifies an opaque credential and yields the actor it belongs to.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str, now: DateTime<Utc>) -> Result<VerifiedActor, AuthError>;
}

impl<V> IdentityVerifier for std::sync::Arc<V>
where
    V: IdentityVerifier + ?Sized,
{
    fn verify(&self, credential: &str, now: DateTime<Utc>) -> Result<VerifiedActor, AuthError> {
        (**self).verify(credential, now)
    }
}

/// HS256 JWT verifier (shared secret).
pub struct Hs256JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Time window is checked by `validate_claims` on our own claim names.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }
}

impl IdentityVerifier for Hs256JwtValidator {
    fn verify(&self, credential: &str, now: DateTime<Utc>) -> Result<VerifiedActor, AuthError> {
        let token = credential.trim();
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token verification failed");
            AuthError::InvalidToken(e.to_string())
        })?;

        validate_claims(&data.claims, now)?;
        Ok(VerifiedActor::new(data.claims.sub, data.claims.roles))
    }
}

/// Fixed token table for tests.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityVerifier {
    tokens: std::collections::HashMap<String, (ActorId, Vec<Role>)>,
}

#[cfg(any(test, feature = "test-util"))]
impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as belonging to `actor`.
    ///
    /// Panics if `actor` is not a valid actor id; meant for fixtures.
    pub fn with_actor(mut self, token: impl Into<String>, actor: &str, roles: Vec<Role>) -> Self {
        let actor = ActorId::parse(actor).unwrap_or_else(|e| panic!("fixture actor id: {e}"));
        self.tokens.insert(token.into(), (actor, roles));
        self
    }
}

#[cfg(any(test, feature = "test-util"))]
impl IdentityVerifier for StaticIdentityVerifier {
    fn verify(&self, credential: &str, _now: DateTime<Utc>) -> Result<VerifiedActor, AuthError> {
        let token = credential.trim();
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        self.tokens
            .get(token)
            .map(|(id, roles)| VerifiedActor::new(id.clone(), roles.clone()))
            .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))
    }
}

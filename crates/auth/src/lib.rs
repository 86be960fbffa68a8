//! `glyphmart-auth` — identity boundary for interaction tracking.
//!
//! This crate is intentionally decoupled from HTTP and storage. It answers two
//! questions: "who is this verified actor?" (likes, admin operations) and
//! "what best-effort key identifies this anonymous origin?" (views, downloads).

pub mod claims;
pub mod identity;
pub mod origin;
pub mod roles;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use identity::{AuthError, Hs256JwtValidator, IdentityVerifier, VerifiedActor};
#[cfg(any(test, feature = "test-util"))]
pub use identity::StaticIdentityVerifier;
pub use origin::fingerprint;
pub use roles::{AdminPolicy, Role};

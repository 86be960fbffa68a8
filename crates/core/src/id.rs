//! Strongly-typed identifiers used across the domain.
//!
//! Identifiers are validated strings. `SubjectId` may never contain `_`, which
//! keeps the composite interaction key `"{subject}_{actor}"` unambiguous.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

const MAX_SUBJECT_ID_LEN: usize = 128;
const MAX_ACTOR_LEN: usize = 256;

/// Identifier of a subject (an entity that accumulates interactions).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

/// Verified identity of an authenticated actor (token subject).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

/// Key stored on an interaction event.
///
/// For likes this is the verified actor id; for views and downloads it is a
/// best-effort anonymous fingerprint, so deduplication there is approximate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorKey(String);

fn validate_subject_id(value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::invalid_id("SubjectId: empty"));
    }
    if value.len() > MAX_SUBJECT_ID_LEN {
        return Err(DomainError::invalid_id(format!(
            "SubjectId: longer than {MAX_SUBJECT_ID_LEN} bytes"
        )));
    }
    if let Some(c) = value.chars().find(|c| matches!(c, '_' | '/') || c.is_control() || c.is_whitespace()) {
        return Err(DomainError::invalid_id(format!(
            "SubjectId: reserved character {c:?}"
        )));
    }
    Ok(())
}

fn validate_actor(value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::invalid_id("actor: empty"));
    }
    if value.len() > MAX_ACTOR_LEN {
        return Err(DomainError::invalid_id(format!(
            "actor: longer than {MAX_ACTOR_LEN} bytes"
        )));
    }
    if let Some(c) = value.chars().find(|c| *c == '/' || c.is_control() || c.is_whitespace()) {
        return Err(DomainError::invalid_id(format!("actor: reserved character {c:?}")));
    }
    Ok(())
}

macro_rules! impl_string_newtype {
    ($t:ty, $validate:path) => {
        impl $t {
            /// Validate and wrap a raw identifier.
            pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                $validate(&value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

impl_string_newtype!(SubjectId, validate_subject_id);
impl_string_newtype!(ActorId, validate_actor);
impl_string_newtype!(ActorKey, validate_actor);

impl SubjectId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered) in simple form, so ids sort by creation time
    /// and never contain `_`.
    pub fn new() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }
}

impl Default for SubjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorKey {
    /// Key for an interaction performed by a verified actor.
    pub fn verified(actor: &ActorId) -> Self {
        Self(actor.0.clone())
    }

    /// Key for an anonymous interaction, derived from a network-origin fingerprint.
    pub fn anonymous(fingerprint: &str) -> Result<Self, DomainError> {
        Self::parse(fingerprint.trim())
    }

    /// Shared key for anonymous callers whose origin cannot be determined.
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }
}

//! Interaction events and their composite identity.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::DomainError;
use crate::id::{ActorKey, SubjectId};

/// Kind of interaction an actor can have with a subject.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    View,
    Download,
    Like,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 3] = [
        InteractionKind::View,
        InteractionKind::Download,
        InteractionKind::Like,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::View => "view",
            InteractionKind::Download => "download",
            InteractionKind::Like => "like",
        }
    }

    /// Ledger collection holding events of this kind.
    pub fn collection(self) -> &'static str {
        match self {
            InteractionKind::View => "subject_views",
            InteractionKind::Download => "subject_downloads",
            InteractionKind::Like => "subject_likes",
        }
    }

    /// Whether events of this kind can be removed again (toggle semantics).
    pub fn is_reversible(self) -> bool {
        matches!(self, InteractionKind::Like)
    }
}

impl core::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(InteractionKind::View),
            "download" => Ok(InteractionKind::Download),
            "like" => Ok(InteractionKind::Like),
            other => Err(DomainError::UnknownKind(other.to_string())),
        }
    }
}

/// Composite identity of an interaction: at most one event exists per key.
///
/// The key is used directly as the record identifier, so "does this event
/// exist?" is always a point lookup and creation is a create-if-absent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InteractionKey {
    pub subject: SubjectId,
    pub actor: ActorKey,
    pub kind: InteractionKind,
}

impl InteractionKey {
    pub fn new(subject: SubjectId, actor: ActorKey, kind: InteractionKind) -> Self {
        Self {
            subject,
            actor,
            kind,
        }
    }

    /// Record identifier inside the kind's collection: `"{subject}_{actor}"`.
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.subject, self.actor)
    }

    /// Inverse of [`InteractionKey::document_id`].
    ///
    /// Subject ids never contain `_`, so the first `_` is the separator.
    pub fn from_document_id(kind: InteractionKind, document_id: &str) -> Result<Self, DomainError> {
        let (subject, actor) = document_id
            .split_once('_')
            .ok_or_else(|| DomainError::invalid_id(format!("malformed interaction id '{document_id}'")))?;
        Ok(Self {
            subject: SubjectId::parse(subject)?,
            actor: ActorKey::parse(actor)?,
            kind,
        })
    }
}

/// One recorded interaction (the ledger row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub key: InteractionKey,
    pub recorded_at: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(key: InteractionKey, recorded_at: DateTime<Utc>) -> Self {
        Self { key, recorded_at }
    }
}

impl Entity for InteractionEvent {
    type Id = InteractionKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }
}

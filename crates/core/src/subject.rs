//! Subjects and their denormalized counter projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::DomainError;
use crate::id::{ActorId, SubjectId};
use crate::interaction::InteractionKind;

/// Denormalized interaction totals stored on a subject.
///
/// Each field should converge to the number of ledger events of the matching
/// kind; the auditor restores that after partial failures or manual edits.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counters {
    pub views: u64,
    pub downloads: u64,
    pub likes: u64,
}

impl Counters {
    pub fn new(views: u64, downloads: u64, likes: u64) -> Self {
        Self {
            views,
            downloads,
            likes,
        }
    }

    pub fn get(&self, kind: InteractionKind) -> u64 {
        match kind {
            InteractionKind::View => self.views,
            InteractionKind::Download => self.downloads,
            InteractionKind::Like => self.likes,
        }
    }

    pub fn set(&mut self, kind: InteractionKind, value: u64) {
        match kind {
            InteractionKind::View => self.views = value,
            InteractionKind::Download => self.downloads = value,
            InteractionKind::Like => self.likes = value,
        }
    }

    /// Apply a +1/-1 style delta. Never goes below zero.
    pub fn apply_delta(&mut self, kind: InteractionKind, delta: i64) -> u64 {
        let current = self.get(kind);
        let next = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        self.set(kind, next);
        next
    }
}

/// An entity that accumulates interactions (e.g. a shared glyph asset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: SubjectId,
    pub owner: ActorId,
    pub title: String,
    #[serde(flatten)]
    pub counters: Counters,
    pub last_count_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subject {
    pub const MAX_TITLE_LEN: usize = 200;

    /// A freshly created subject: all counters at zero, never audited.
    pub fn new(
        id: SubjectId,
        owner: ActorId,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let title = title.into().trim().to_string();
        if title.is_empty() {
            return Err(DomainError::validation("title must not be empty"));
        }
        if title.chars().count() > Self::MAX_TITLE_LEN {
            return Err(DomainError::validation(format!(
                "title must be at most {} characters",
                Self::MAX_TITLE_LEN
            )));
        }
        Ok(Self {
            id,
            owner,
            title,
            counters: Counters::default(),
            last_count_sync: None,
            created_at,
        })
    }
}

impl Entity for Subject {
    type Id = SubjectId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

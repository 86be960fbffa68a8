//! `glyphmart-core` — domain building blocks for interaction counting.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, subjects with their denormalized counters, and the composite
//! interaction key that makes event creation idempotent.

pub mod entity;
pub mod error;
pub mod id;
pub mod interaction;
pub mod subject;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{ActorId, ActorKey, SubjectId};
pub use interaction::{InteractionEvent, InteractionKey, InteractionKind};
pub use subject::{Counters, Subject};

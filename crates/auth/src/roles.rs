use std::borrow::Cow;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use glyphmart_core::ActorId;

use crate::identity::VerifiedActor;

/// Role identifier carried in tokens.
///
/// Roles are opaque strings; only [`Role::ADMIN`] has meaning to this service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides who may run admin operations (counter sync, cache control, stats).
///
/// An actor is an admin if its token carries the `admin` role or its id is
/// listed as a configured super-admin.
#[derive(Debug, Clone, Default)]
pub struct AdminPolicy {
    super_admins: HashSet<ActorId>,
}

impl AdminPolicy {
    pub fn new(super_admins: impl IntoIterator<Item = ActorId>) -> Self {
        Self {
            super_admins: super_admins.into_iter().collect(),
        }
    }

    pub fn is_admin(&self, actor: &VerifiedActor) -> bool {
        actor.has_role(&Role::ADMIN) || self.super_admins.contains(actor.id())
    }
}

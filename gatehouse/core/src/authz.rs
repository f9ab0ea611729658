//! Subjects, roles and the permissions granted to them.
//!
//! A subject holds permissions directly and through the roles it is a member
//! of. Roles hold permissions only: role membership is never transitive.

mod graph;
mod memory;

pub use self::{
    graph::{AuthorizationGraph, DECISION_CACHE_TTL},
    memory::InMemoryStore,
};
use crate::Error;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// The grants held directly by a subject.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectGrants {
    pub permissions: BTreeSet<String>,
    pub roles: BTreeSet<String>,
}

/// The grants held by a role.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleGrants {
    pub permissions: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// The answer to an authorization query: one entry per requested permission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Authorization {
    pub permissions: BTreeMap<String, bool>,

    /// How long the caller may rely on this answer, when the authority
    /// offers a hint.
    pub cache_ttl: Option<DateTime<Utc>>,
}

/// A single, atomically applied change to the grant graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    CreateSubject {
        subject: String,
        permissions: BTreeSet<String>,
        roles: BTreeSet<String>,
    },
    AddSubjectPermissions {
        subject: String,
        permissions: BTreeSet<String>,
    },
    RemoveSubjectPermissions {
        subject: String,
        permissions: BTreeSet<String>,
    },
    AddSubjectRoles {
        subject: String,
        roles: BTreeSet<String>,
    },
    RemoveSubjectRoles {
        subject: String,
        roles: BTreeSet<String>,
    },
    CreateRole {
        role: String,
        permissions: BTreeSet<String>,
    },
    AddRolePermissions {
        role: String,
        permissions: BTreeSet<String>,
    },
    RemoveRolePermissions {
        role: String,
        permissions: BTreeSet<String>,
    },
}

/// What a management call did, as reported back to the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Created,
    Added,
    Removed,
}

/// Persistence for grants.
///
/// Unknown ids read as empty grants. Every `apply` either takes effect in
/// full or fails with [`Error::BackingStoreUnavailable`].
#[async_trait::async_trait]
pub trait GrantStore: Send + Sync {
    async fn subject(&self, id: &str) -> Result<SubjectGrants, Error>;

    async fn role(&self, id: &str) -> Result<RoleGrants, Error>;

    async fn apply(&self, mutation: Mutation) -> Result<(), Error>;
}

/// Answers whether a subject holds a set of permissions.
#[async_trait::async_trait]
pub trait Authorize: Send + Sync {
    async fn authorize(&self, subject: &str, permissions: &[String])
        -> Result<Authorization, Error>;
}

// === impl Authorization ===

impl Authorization {
    /// Builds an answer for `requested`, treating anything absent from
    /// `granted` as not held.
    pub fn from_requested<'a>(
        requested: impl IntoIterator<Item = &'a String>,
        granted: impl Fn(&str) -> bool,
    ) -> Self {
        let permissions = requested
            .into_iter()
            .map(|p| (p.clone(), granted(p)))
            .collect();
        Self {
            permissions,
            cache_ttl: None,
        }
    }

    /// Allows only when every requested permission is held.
    ///
    /// An answer that covers no permissions at all vouches for nothing and
    /// is a denial.
    pub fn decision(&self) -> Decision {
        if !self.permissions.is_empty() && self.permissions.values().all(|held| *held) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision() == Decision::Allow
    }
}

// === impl Mutation ===

impl Mutation {
    pub fn change(&self) -> Change {
        match self {
            Self::CreateSubject { .. } | Self::CreateRole { .. } => Change::Created,
            Self::AddSubjectPermissions { .. }
            | Self::AddSubjectRoles { .. }
            | Self::AddRolePermissions { .. } => Change::Added,
            Self::RemoveSubjectPermissions { .. }
            | Self::RemoveSubjectRoles { .. }
            | Self::RemoveRolePermissions { .. } => Change::Removed,
        }
    }

    /// The subject whose grants this mutation touches, if it touches a
    /// single subject.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::CreateSubject { subject, .. }
            | Self::AddSubjectPermissions { subject, .. }
            | Self::RemoveSubjectPermissions { subject, .. }
            | Self::AddSubjectRoles { subject, .. }
            | Self::RemoveSubjectRoles { subject, .. } => Some(subject),
            Self::CreateRole { .. }
            | Self::AddRolePermissions { .. }
            | Self::RemoveRolePermissions { .. } => None,
        }
    }
}

// === impl Change ===

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Added => "added",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

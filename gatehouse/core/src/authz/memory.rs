use super::{GrantStore, Mutation, RoleGrants, SubjectGrants};
use crate::Error;
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};

/// A process-local grant store.
///
/// Each mutation is applied under a single write lock, so readers observe
/// either none or all of it.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore(Arc<RwLock<Grants>>);

#[derive(Debug, Default)]
struct Grants {
    subjects: HashMap<String, SubjectGrants>,
    roles: HashMap<String, RoleGrants>,
}

// === impl InMemoryStore ===

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl GrantStore for InMemoryStore {
    async fn subject(&self, id: &str) -> Result<SubjectGrants, Error> {
        Ok(self.0.read().subjects.get(id).cloned().unwrap_or_default())
    }

    async fn role(&self, id: &str) -> Result<RoleGrants, Error> {
        Ok(self.0.read().roles.get(id).cloned().unwrap_or_default())
    }

    async fn apply(&self, mutation: Mutation) -> Result<(), Error> {
        self.0.write().apply(mutation);
        Ok(())
    }
}

// === impl Grants ===

impl Grants {
    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::CreateSubject {
                subject,
                permissions,
                roles,
            } => {
                self.subjects
                    .insert(subject, SubjectGrants { permissions, roles });
            }
            Mutation::AddSubjectPermissions {
                subject,
                permissions,
            } => union(&mut self.subject_mut(subject).permissions, permissions),
            Mutation::RemoveSubjectPermissions {
                subject,
                permissions,
            } => difference(&mut self.subject_mut(subject).permissions, &permissions),
            Mutation::AddSubjectRoles { subject, roles } => {
                union(&mut self.subject_mut(subject).roles, roles)
            }
            Mutation::RemoveSubjectRoles { subject, roles } => {
                difference(&mut self.subject_mut(subject).roles, &roles)
            }
            Mutation::CreateRole { role, permissions } => {
                self.roles.insert(role, RoleGrants { permissions });
            }
            Mutation::AddRolePermissions { role, permissions } => {
                union(&mut self.role_mut(role).permissions, permissions)
            }
            Mutation::RemoveRolePermissions { role, permissions } => {
                difference(&mut self.role_mut(role).permissions, &permissions)
            }
        }
    }

    fn subject_mut(&mut self, id: String) -> &mut SubjectGrants {
        self.subjects.entry(id).or_default()
    }

    fn role_mut(&mut self, id: String) -> &mut RoleGrants {
        self.roles.entry(id).or_default()
    }
}

fn union(set: &mut BTreeSet<String>, items: BTreeSet<String>) {
    set.extend(items);
}

fn difference(set: &mut BTreeSet<String>, items: &BTreeSet<String>) {
    set.retain(|item| !items.contains(item));
}

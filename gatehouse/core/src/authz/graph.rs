use super::{
    Authorization, Authorize, Change, GrantStore, Mutation, RoleGrants, SubjectGrants,
};
use crate::Error;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a subject's resolved permissions are reused before the store is
/// consulted again. Mutations invalidate entries immediately.
pub const DECISION_CACHE_TTL: Duration = Duration::from_secs(15);

/// Answers authorization queries against a [`GrantStore`] and applies the
/// management operations to it.
#[derive(Debug)]
pub struct AuthorizationGraph<S> {
    store: S,
    ttl: Duration,
    resolved: Mutex<HashMap<String, Resolved>>,

    /// Bumped after every applied mutation. A resolution that started under
    /// an older generation is not cached.
    generation: AtomicU64,
}

#[derive(Debug)]
struct Resolved {
    permissions: Arc<HashSet<String>>,
    expires: Instant,
}

// === impl AuthorizationGraph ===

impl<S: GrantStore> AuthorizationGraph<S> {
    pub fn new(store: S) -> Self {
        Self::with_cache_ttl(store, DECISION_CACHE_TTL)
    }

    pub fn with_cache_ttl(store: S, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            resolved: Mutex::new(HashMap::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns an entry per requested permission. The subject holds a
    /// permission if it is granted directly or to one of its roles.
    pub async fn authorize(
        &self,
        subject: &str,
        permissions: &[String],
    ) -> Result<Authorization, Error> {
        let held = self.resolve(subject).await?;
        let authz = Authorization::from_requested(permissions, |p| held.contains(p));
        debug!(%subject, ?authz.permissions, "Resolved authorization");
        Ok(authz)
    }

    pub async fn create_subject_permissions(
        &self,
        subject: &str,
        permissions: impl IntoIterator<Item = impl Into<String>>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::CreateSubject {
            subject: subject.to_string(),
            permissions: to_set(permissions),
            roles: to_set(roles),
        })
        .await
    }

    pub async fn add_subject_permissions(
        &self,
        subject: &str,
        permissions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::AddSubjectPermissions {
            subject: subject.to_string(),
            permissions: to_set(permissions),
        })
        .await
    }

    pub async fn remove_subject_permissions(
        &self,
        subject: &str,
        permissions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::RemoveSubjectPermissions {
            subject: subject.to_string(),
            permissions: to_set(permissions),
        })
        .await
    }

    pub async fn add_subject_roles(
        &self,
        subject: &str,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::AddSubjectRoles {
            subject: subject.to_string(),
            roles: to_set(roles),
        })
        .await
    }

    pub async fn remove_subject_roles(
        &self,
        subject: &str,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::RemoveSubjectRoles {
            subject: subject.to_string(),
            roles: to_set(roles),
        })
        .await
    }

    pub async fn create_role_permissions(
        &self,
        role: &str,
        permissions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::CreateRole {
            role: role.to_string(),
            permissions: to_set(permissions),
        })
        .await
    }

    pub async fn add_role_permissions(
        &self,
        role: &str,
        permissions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::AddRolePermissions {
            role: role.to_string(),
            permissions: to_set(permissions),
        })
        .await
    }

    pub async fn remove_role_permissions(
        &self,
        role: &str,
        permissions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Change, Error> {
        self.mutate(Mutation::RemoveRolePermissions {
            role: role.to_string(),
            permissions: to_set(permissions),
        })
        .await
    }

    /// Lists the permissions and roles granted directly to `subject`.
    /// Permissions reachable only through a role are not included.
    pub async fn list_subject_authz(&self, subject: &str) -> Result<SubjectGrants, Error> {
        self.store.subject(subject).await
    }

    pub async fn list_role_permissions(&self, role: &str) -> Result<RoleGrants, Error> {
        self.store.role(role).await
    }

    pub async fn mutate(&self, mutation: Mutation) -> Result<Change, Error> {
        let change = mutation.change();
        let subject = mutation.subject().map(str::to_string);
        self.store.apply(mutation).await?;

        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut resolved = self.resolved.lock();
        match subject {
            Some(ref subject) => {
                resolved.remove(subject);
            }
            // Any subject may hold the role.
            None => resolved.clear(),
        }
        drop(resolved);

        info!(subject = subject.as_deref(), %change, "Applied grant change");
        Ok(change)
    }

    async fn resolve(&self, subject: &str) -> Result<Arc<HashSet<String>>, Error> {
        let now = Instant::now();
        if let Some(r) = self.resolved.lock().get(subject) {
            if r.expires > now {
                return Ok(r.permissions.clone());
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        let SubjectGrants { permissions, roles } = self.store.subject(subject).await?;
        let mut held = permissions.into_iter().collect::<HashSet<_>>();
        for role in &roles {
            held.extend(self.store.role(role).await?.permissions);
        }
        let held = Arc::new(held);

        let mut resolved = self.resolved.lock();
        if self.generation.load(Ordering::Acquire) == generation {
            resolved.insert(
                subject.to_string(),
                Resolved {
                    permissions: held.clone(),
                    expires: now + self.ttl,
                },
            );
        }
        Ok(held)
    }
}

#[async_trait::async_trait]
impl<S: GrantStore> Authorize for AuthorizationGraph<S> {
    async fn authorize(
        &self,
        subject: &str,
        permissions: &[String],
    ) -> Result<Authorization, Error> {
        AuthorizationGraph::authorize(self, subject, permissions).await
    }
}

fn to_set(items: impl IntoIterator<Item = impl Into<String>>) -> BTreeSet<String> {
    items.into_iter().map(Into::into).collect()
}

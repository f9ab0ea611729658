//! Dynamic service registrations and the deployments that back them.

use crate::{
    routes::{required_permission, InvalidRoute, Protocol, Route, RoutePattern, Source, Target},
    Error,
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::{fmt, str::FromStr, sync::Arc};
use uuid::Uuid;

/// A service asking to receive traffic for a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub service: String,
    /// `/svc/b` and `/svc/b/*` both route everything under `/svc/b`; a
    /// registration always owns a prefix.
    pub path: String,
    pub hosts: Vec<String>,
    pub port: u16,
    pub tls: bool,
    pub protocol: Protocol,
    pub permission: Option<String>,
}

/// A change observed on a registry feed. Feeds deliver at least once, so
/// applying an event twice must be harmless.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The complete set of live registrations.
    Reset(Vec<Registration>),
    Upsert(Registration),
    Remove { service: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeploymentId(Uuid);

/// A persisted registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub registration: Registration,
}

/// Persistence for deployments.
#[async_trait::async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Stores `deployment`, replacing and returning any deployment of the
    /// same service.
    async fn insert(&self, deployment: Deployment) -> Result<Option<Deployment>, Error>;

    async fn delete(&self, id: DeploymentId) -> Result<Option<Deployment>, Error>;

    async fn list(&self) -> Result<Vec<Deployment>, Error>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDeployments(Arc<RwLock<HashMap<DeploymentId, Deployment>>>);

// === impl Registration ===

impl Registration {
    /// Builds the route this registration publishes into `namespace`.
    pub fn to_route(&self, namespace: &str) -> Result<Route, Error> {
        self.route(namespace)
            .map_err(|e| Error::MalformedRegistrationEvent(e.to_string()))
    }

    fn route(&self, namespace: &str) -> Result<Route, InvalidRoute> {
        if self.service.trim().is_empty() {
            return Err(InvalidRoute::Path(format!(
                "{}: registration has no service name",
                self.path
            )));
        }

        let path = self.path.trim();
        let path = path.strip_suffix("/*").unwrap_or(path).trim_end_matches('/');
        let pattern = match format!("{path}/*").parse::<RoutePattern>()? {
            RoutePattern::Prefix(p) => RoutePattern::Prefix(p),
            RoutePattern::Exact(p) => return Err(InvalidRoute::Path(p)),
        };

        let targets = self
            .hosts
            .iter()
            .map(|host| {
                if host.contains(':') && !host.starts_with('[') {
                    format!("[{host}]:{}", self.port).parse::<Target>()
                } else {
                    format!("{host}:{}", self.port).parse::<Target>()
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        if targets.is_empty() {
            return Err(InvalidRoute::NoTargets(pattern.to_string()));
        }

        Ok(Route {
            pattern,
            targets,
            permission: required_permission(self.permission.as_deref()),
            tls: self.tls,
            protocol: self.protocol,
            source: Source::Registry {
                namespace: namespace.to_string(),
                service: self.service.clone(),
            },
        })
    }
}

// === impl DeploymentId ===

impl DeploymentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for DeploymentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// === impl InMemoryDeployments ===

#[async_trait::async_trait]
impl DeploymentStore for InMemoryDeployments {
    async fn insert(&self, deployment: Deployment) -> Result<Option<Deployment>, Error> {
        let mut deployments = self.0.write();
        let replaced = deployments
            .values()
            .find(|d| d.registration.service == deployment.registration.service)
            .map(|d| d.id);
        let previous = replaced.and_then(|id| deployments.remove(&id));
        deployments.insert(deployment.id, deployment);
        Ok(previous)
    }

    async fn delete(&self, id: DeploymentId) -> Result<Option<Deployment>, Error> {
        Ok(self.0.write().remove(&id))
    }

    async fn list(&self) -> Result<Vec<Deployment>, Error> {
        Ok(self.0.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(path: &str, hosts: &[&str]) -> Registration {
        Registration {
            service: "svc-b".to_string(),
            path: path.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            port: 8080,
            tls: false,
            protocol: Protocol::Http1,
            permission: Some("svc-b-access".to_string()),
        }
    }

    #[test]
    fn registrations_own_a_prefix() {
        for path in ["/svc/b", "/svc/b/", "/svc/b/*"] {
            let route = registration(path, &["10.0.0.2"]).to_route("ns").unwrap();
            assert_eq!(route.pattern, RoutePattern::Prefix("/svc/b".to_string()));
            assert_eq!(route.permission.as_deref(), Some("svc-b-access"));
            assert_eq!(
                route.source,
                Source::Registry {
                    namespace: "ns".to_string(),
                    service: "svc-b".to_string(),
                }
            );
        }
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let route = registration("/svc/b", &["::1"]).to_route("ns").unwrap();
        assert_eq!(route.targets[0].to_string(), "[::1]:8080");
    }

    #[test]
    fn malformed_registrations() {
        let no_hosts = registration("/svc/b", &[]).to_route("ns");
        assert!(matches!(
            no_hosts,
            Err(Error::MalformedRegistrationEvent(_))
        ));

        let relative = registration("svc/b", &["10.0.0.2"]).to_route("ns");
        assert!(matches!(
            relative,
            Err(Error::MalformedRegistrationEvent(_))
        ));

        let mut unnamed = registration("/svc/b", &["10.0.0.2"]);
        unnamed.service = String::new();
        assert!(unnamed.to_route("ns").is_err());
    }

    #[tokio::test]
    async fn reinserting_a_service_replaces_it() {
        let store = InMemoryDeployments::default();
        let first = Deployment {
            id: DeploymentId::generate(),
            registration: registration("/svc/b", &["10.0.0.2"]),
        };
        assert_eq!(store.insert(first.clone()).await.unwrap(), None);

        let second = Deployment {
            id: DeploymentId::generate(),
            registration: registration("/svc/b", &["10.0.0.3"]),
        };
        assert_eq!(store.insert(second.clone()).await.unwrap(), Some(first));
        assert_eq!(store.list().await.unwrap(), vec![second.clone()]);

        assert_eq!(store.delete(second.id).await.unwrap(), Some(second));
        assert!(store.list().await.unwrap().is_empty());
    }
}

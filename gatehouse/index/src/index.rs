use crate::table::RouteTable;
use ahash::AHashMap as HashMap;
use gatehouse_core::{
    registry::{Registration, RegistryEvent},
    routes::Route,
    Error,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds every route source and publishes their merge into a [`RouteTable`].
///
/// Each registry namespace is owned by a single watcher. Writes go through
/// the index lock, so publishes are serialized.
#[derive(Debug)]
pub struct Index {
    table: Arc<RouteTable>,
    static_routes: Vec<Arc<Route>>,
    namespaces: HashMap<String, NamespaceIndex>,
}

#[derive(Debug, Default)]
struct NamespaceIndex {
    by_service: HashMap<String, Arc<Route>>,
}

// === impl Index ===

impl Index {
    /// Builds the index and publishes the static routes before returning, so
    /// the table is never empty once traffic can be admitted.
    pub fn shared(table: Arc<RouteTable>, static_routes: Vec<Route>) -> SharedIndex {
        let index = Self {
            table,
            static_routes: static_routes.into_iter().map(Arc::new).collect(),
            namespaces: HashMap::default(),
        };
        let version = index.publish();
        info!(routes = index.static_routes.len(), version, "Published static routes");
        Arc::new(RwLock::new(index))
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Applies a registry event to `namespace`. Returns whether a new
    /// snapshot was published.
    pub fn handle(&mut self, namespace: &str, event: RegistryEvent) -> Result<bool, Error> {
        match event {
            RegistryEvent::Reset(registrations) => Ok(self.reset(namespace, registrations)),
            RegistryEvent::Upsert(registration) => self.apply(namespace, registration),
            RegistryEvent::Remove { service } => Ok(self.delete(namespace, &service)),
        }
    }

    /// Adds or replaces the route for a registration's service.
    ///
    /// A malformed registration leaves the namespace untouched.
    pub fn apply(&mut self, namespace: &str, registration: Registration) -> Result<bool, Error> {
        let route = Arc::new(registration.to_route(namespace)?);
        let ns = self.namespaces.entry(namespace.to_string()).or_default();
        if ns.by_service.get(&registration.service) == Some(&route) {
            debug!(%namespace, service = %registration.service, "Registration unchanged");
            return Ok(false);
        }

        ns.by_service.insert(registration.service, route);
        self.publish();
        Ok(true)
    }

    pub fn delete(&mut self, namespace: &str, service: &str) -> bool {
        let removed = self
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.by_service.remove(service))
            .is_some();
        if removed {
            self.publish();
        } else {
            debug!(%namespace, %service, "Deregistration of an unknown service");
        }
        removed
    }

    /// Replaces the contents of `namespace`.
    ///
    /// Malformed registrations are dropped; the service keeps whatever route
    /// it had before.
    pub fn reset(&mut self, namespace: &str, registrations: Vec<Registration>) -> bool {
        let ns = self.namespaces.entry(namespace.to_string()).or_default();
        let mut by_service = HashMap::with_capacity(registrations.len());
        for registration in registrations {
            match registration.to_route(namespace) {
                Ok(route) => {
                    by_service.insert(registration.service, Arc::new(route));
                }
                Err(error) => {
                    warn!(%namespace, service = %registration.service, %error, "Dropping registration");
                    if let Some(prior) = ns.by_service.get(&registration.service) {
                        by_service.insert(registration.service, prior.clone());
                    }
                }
            }
        }

        if same_routes(&ns.by_service, &by_service) {
            debug!(%namespace, "Reset left routes unchanged");
            return false;
        }
        ns.by_service = by_service;
        self.publish();
        true
    }

    pub(crate) fn static_routes(&self) -> usize {
        self.static_routes.len()
    }

    pub(crate) fn namespace_sizes(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.namespaces
            .iter()
            .map(|(name, ns)| (name.as_str(), ns.by_service.len()))
    }

    fn publish(&self) -> u64 {
        let routes = self
            .static_routes
            .iter()
            .cloned()
            .chain(
                self.namespaces
                    .values()
                    .flat_map(|ns| ns.by_service.values().cloned()),
            )
            .collect::<Vec<_>>();
        let count = routes.len();
        let version = self.table.publish(routes);
        debug!(version, routes = count, "Published route table");
        version
    }
}

fn same_routes(a: &HashMap<String, Arc<Route>>, b: &HashMap<String, Arc<Route>>) -> bool {
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::routes::{Protocol, RoutePattern, Source};

    fn static_route(pattern: &str, permission: &str) -> Route {
        Route {
            pattern: pattern.parse().unwrap(),
            targets: vec!["static:80".parse().unwrap()],
            permission: Some(permission.to_string()),
            tls: false,
            protocol: Protocol::Http1,
            source: Source::Static,
        }
    }

    fn registration(service: &str, path: &str) -> Registration {
        Registration {
            service: service.to_string(),
            path: path.to_string(),
            hosts: vec!["10.0.0.1".to_string()],
            port: 8080,
            tls: false,
            protocol: Protocol::Http1,
            permission: Some(format!("{service}-access")),
        }
    }

    fn index() -> SharedIndex {
        Index::shared(
            Arc::new(RouteTable::new()),
            vec![static_route("/svc/a/*", "svc-a-access")],
        )
    }

    #[test]
    fn static_routes_are_published_up_front() {
        let index = index();
        let table = index.read().table().clone();
        assert_eq!(table.version(), 1);
        let route = table.lookup("/svc/a/orders").expect("static route");
        assert_eq!(route.permission.as_deref(), Some("svc-a-access"));
    }

    #[test]
    fn static_and_dynamic_routes_coexist() {
        let index = index();
        let table = index.read().table().clone();
        assert!(table.lookup("/svc/b/x").is_none());

        assert!(index
            .write()
            .apply("registry", registration("svc-b", "/svc/b"))
            .unwrap());

        let a = table.lookup("/svc/a/x").unwrap();
        assert_eq!(a.permission.as_deref(), Some("svc-a-access"));
        let b = table.lookup("/svc/b/x").unwrap();
        assert_eq!(b.permission.as_deref(), Some("svc-b-access"));
        assert_eq!(b.pattern, RoutePattern::Prefix("/svc/b".to_string()));
    }

    #[test]
    fn duplicate_events_are_idempotent() {
        let index = index();
        let table = index.read().table().clone();
        let mut index = index.write();
        assert!(index.apply("ns", registration("svc-b", "/svc/b")).unwrap());
        let version = table.version();

        assert!(!index.apply("ns", registration("svc-b", "/svc/b")).unwrap());
        assert!(!index.reset("ns", vec![registration("svc-b", "/svc/b")]));
        assert_eq!(table.version(), version);

        assert!(index.delete("ns", "svc-b"));
        assert!(!index.delete("ns", "svc-b"));
        assert!(table.lookup("/svc/b/x").is_none());
    }

    #[test]
    fn reregistration_replaces_the_route() {
        let index = index();
        let table = index.read().table().clone();
        let mut index = index.write();
        index.apply("ns", registration("svc-b", "/svc/b")).unwrap();
        index.apply("ns", registration("svc-b", "/svc/b2")).unwrap();
        assert!(table.lookup("/svc/b/x").is_none());
        assert!(table.lookup("/svc/b2/x").is_some());
    }

    #[test]
    fn malformed_events_keep_the_previous_snapshot() {
        let index = index();
        let table = index.read().table().clone();
        let mut index = index.write();
        index.apply("ns", registration("svc-b", "/svc/b")).unwrap();
        let before = table.snapshot();

        let mut broken = registration("svc-b", "/svc/b");
        broken.hosts.clear();
        let err = index.apply("ns", broken.clone()).unwrap_err();
        assert!(matches!(err, Error::MalformedRegistrationEvent(_)));
        assert_eq!(table.version(), before.version());

        // A reset carrying the malformed entry keeps the prior route and
        // drops services that are no longer listed.
        index.apply("ns", registration("svc-c", "/svc/c")).unwrap();
        index.reset("ns", vec![broken]);
        assert!(table.lookup("/svc/b/x").is_some());
        assert!(table.lookup("/svc/c/x").is_none());
    }

    #[test]
    fn namespaces_are_independent() {
        let index = index();
        let table = index.read().table().clone();
        let mut index = index.write();
        index.apply("one", registration("svc-b", "/svc/b")).unwrap();
        index.reset("two", vec![registration("svc-c", "/svc/c")]);
        index.reset("two", Vec::new());

        assert!(table.lookup("/svc/b/x").is_some());
        assert!(table.lookup("/svc/c/x").is_none());
        assert!(table.lookup("/svc/a/x").is_some());
    }

    #[test]
    fn static_routes_shadow_identical_registrations() {
        let index = index();
        let table = index.read().table().clone();
        index
            .write()
            .apply("ns", registration("svc-a", "/svc/a"))
            .unwrap();
        let route = table.lookup("/svc/a/x").unwrap();
        assert_eq!(route.source, Source::Static);
    }
}

use arc_swap::ArcSwap;
use gatehouse_core::routes::Route;
use std::sync::Arc;
use thiserror::Error;

/// A complete, immutable set of routes.
///
/// Routes are held in lookup order, so the first match is the most specific
/// one.
#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    routes: Vec<Arc<Route>>,
}

/// The routes currently served by the gateway.
///
/// Readers load a single snapshot reference without taking a lock; writers
/// replace it whole.
#[derive(Debug)]
pub struct RouteTable {
    current: ArcSwap<Snapshot>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("route table is at version {current}; cannot install version {proposed}")]
pub struct StaleSnapshot {
    pub current: u64,
    pub proposed: u64,
}

// === impl Snapshot ===

impl Snapshot {
    pub fn new(version: u64, mut routes: Vec<Arc<Route>>) -> Self {
        routes.sort_by(|a, b| a.cmp_precedence(b));
        Self { version, routes }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn lookup(&self, path: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| r.pattern.matches(path))
    }
}

// === impl RouteTable ===

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    /// An empty table at version zero.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::new(0, Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<Route>> {
        self.current.load().lookup(path).cloned()
    }

    /// Installs `next` if its version follows the current one and returns
    /// the snapshot it replaced.
    pub fn swap(&self, next: Snapshot) -> Result<Arc<Snapshot>, StaleSnapshot> {
        let next = Arc::new(next);
        loop {
            let current = self.current.load_full();
            if next.version <= current.version {
                return Err(StaleSnapshot {
                    current: current.version,
                    proposed: next.version,
                });
            }

            let prev = self.current.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&prev, &current) {
                return Ok(current);
            }
        }
    }

    /// Installs `routes` as the next version and returns that version.
    pub fn publish(&self, routes: Vec<Arc<Route>>) -> u64 {
        let prev = self
            .current
            .rcu(|cur| Snapshot::new(cur.version + 1, routes.clone()));
        prev.version + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::routes::{Protocol, Source, Target};

    fn route(pattern: &str, target: &str, source: Source) -> Arc<Route> {
        Arc::new(Route {
            pattern: pattern.parse().unwrap(),
            targets: vec![target.parse::<Target>().unwrap()],
            permission: None,
            tls: false,
            protocol: Protocol::Http1,
            source,
        })
    }

    fn dynamic(service: &str) -> Source {
        Source::Registry {
            namespace: "ns".to_string(),
            service: service.to_string(),
        }
    }

    #[test]
    fn most_specific_route_wins() {
        let snapshot = Snapshot::new(
            1,
            vec![
                route("/*", "fallback:80", Source::Static),
                route("/svc/*", "svc:80", Source::Static),
                route("/svc/a/*", "a:80", dynamic("a")),
                route("/svc/a/health", "health:80", dynamic("health")),
            ],
        );

        let target = |path: &str| snapshot.lookup(path).map(|r| r.targets[0].to_string());
        assert_eq!(target("/svc/a/health").as_deref(), Some("health:80"));
        assert_eq!(target("/svc/a/orders").as_deref(), Some("a:80"));
        assert_eq!(target("/svc/b").as_deref(), Some("svc:80"));
        assert_eq!(target("/other").as_deref(), Some("fallback:80"));
    }

    #[test]
    fn static_routes_win_ties() {
        let snapshot = Snapshot::new(
            1,
            vec![
                route("/svc/a/*", "dynamic:80", dynamic("a")),
                route("/svc/a/*", "static:80", Source::Static),
            ],
        );
        let r = snapshot.lookup("/svc/a/x").unwrap();
        assert_eq!(r.source, Source::Static);
    }

    #[test]
    fn misses() {
        let table = RouteTable::new();
        assert_eq!(table.version(), 0);
        assert!(table.lookup("/").is_none());

        table.publish(vec![route("/svc/a/*", "a:80", Source::Static)]);
        assert!(table.lookup("/svc/b/x").is_none());
    }

    #[test]
    fn versions_increase() {
        let table = RouteTable::new();
        assert_eq!(table.publish(Vec::new()), 1);
        assert_eq!(table.publish(Vec::new()), 2);

        let err = table.swap(Snapshot::new(2, Vec::new())).unwrap_err();
        assert_eq!(
            err,
            StaleSnapshot {
                current: 2,
                proposed: 2
            }
        );

        let prev = table
            .swap(Snapshot::new(7, vec![route("/a", "a:80", Source::Static)]))
            .unwrap();
        assert_eq!(prev.version(), 2);
        assert_eq!(table.version(), 7);
        assert!(table.lookup("/a").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_a_mixed_table() {
        // Every snapshot routes both paths to targets carrying the same
        // generation number.
        fn generation(n: u64) -> Vec<Arc<Route>> {
            vec![
                route("/left/*", &format!("left:{}", n + 1), Source::Static),
                route("/right/*", &format!("right:{}", n + 1), Source::Static),
            ]
        }

        let table = Arc::new(RouteTable::new());
        table.publish(generation(0));

        let readers = (0..3)
            .map(|_| {
                let table = table.clone();
                tokio::spawn(async move {
                    for _ in 0..10_000 {
                        let snapshot = table.snapshot();
                        let left = snapshot.lookup("/left/x").unwrap().targets[0].port;
                        let right = snapshot.lookup("/right/x").unwrap().targets[0].port;
                        assert_eq!(left, right, "observed a partially applied table");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();

        for n in 1..1_000 {
            table.publish(generation(n));
            if n % 50 == 0 {
                tokio::task::yield_now().await;
            }
        }

        for reader in readers {
            reader.await.expect("reader must not panic");
        }
    }
}

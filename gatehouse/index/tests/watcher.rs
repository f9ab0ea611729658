use futures::prelude::*;
use gatehouse_core::{
    registry::{Registration, RegistryEvent},
    routes::{Protocol, Route, Source},
    Error,
};
use gatehouse_index::{Backoff, Index, RegistryFeed, RegistryStream, RouteTable, Watcher};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::time;

type Connection = Result<Vec<Result<RegistryEvent, Error>>, Error>;

/// Serves one scripted connection per `watch` call; once the script runs
/// out, connections stay open without events.
#[derive(Clone, Default)]
struct ScriptedFeed {
    script: Arc<Mutex<VecDeque<Connection>>>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl RegistryFeed for ScriptedFeed {
    async fn watch(&self) -> Result<RegistryStream, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(events)) => Ok(Box::pin(stream::iter(events))),
            Some(Err(error)) => Err(error),
            None => Ok(Box::pin(stream::pending::<Result<RegistryEvent, Error>>())),
        }
    }
}

impl ScriptedFeed {
    fn new(script: impl IntoIterator<Item = Connection>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            attempts: Arc::default(),
        }
    }
}

fn svc_a() -> Route {
    Route {
        pattern: "/svc/a/*".parse().unwrap(),
        targets: vec!["10.0.0.1:8080".parse().unwrap()],
        permission: Some("svc-a-access".to_string()),
        tls: false,
        protocol: Protocol::Http1,
        source: Source::Static,
    }
}

fn svc_b() -> Registration {
    Registration {
        service: "svc-b".to_string(),
        path: "/svc/b".to_string(),
        hosts: vec!["10.0.0.2".to_string()],
        port: 8080,
        tls: false,
        protocol: Protocol::Http1,
        permission: Some("svc-b-access".to_string()),
    }
}

fn fast_backoff() -> Backoff {
    Backoff {
        min: time::Duration::from_millis(1),
        max: time::Duration::from_millis(10),
        multiplier: 2.0,
    }
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

async fn until(mut f: impl FnMut() -> bool) {
    time::timeout(time::Duration::from_secs(5), async {
        while !f() {
            time::sleep(time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition must hold before the timeout");
}

#[tokio::test]
async fn dynamic_routes_join_static_routes() {
    let _tracing = init_tracing();

    let table = Arc::new(RouteTable::new());
    let index = Index::shared(table.clone(), vec![svc_a()]);
    assert!(table.lookup("/svc/a/orders").is_some());

    let feed = ScriptedFeed::new([Ok(vec![
        Ok(RegistryEvent::Reset(Vec::new())),
        Ok(RegistryEvent::Upsert(svc_b())),
    ])]);
    let (signal, drain) = drain::channel();
    let watcher = tokio::spawn(
        Watcher::new("registry", feed, index)
            .with_backoff(fast_backoff())
            .run(drain),
    );

    until(|| table.lookup("/svc/b/x").is_some()).await;
    let a = table.lookup("/svc/a/orders").unwrap();
    assert_eq!(a.permission.as_deref(), Some("svc-a-access"));
    let b = table.lookup("/svc/b/x").unwrap();
    assert_eq!(b.permission.as_deref(), Some("svc-b-access"));

    signal.drain().await;
    watcher.await.unwrap();
}

#[tokio::test]
async fn reconnects_and_keeps_serving_stale_routes() {
    let table = Arc::new(RouteTable::new());
    let index = Index::shared(table.clone(), Vec::new());

    let mut broken = svc_b();
    broken.service = "svc-c".to_string();
    broken.path = "relative".to_string();

    let feed = ScriptedFeed::new([
        Err(Error::TransportFailure("refused".to_string())),
        Ok(vec![
            Ok(RegistryEvent::Reset(vec![svc_b()])),
            Err(Error::MalformedRegistrationEvent("undecodable".to_string())),
            Ok(RegistryEvent::Upsert(broken)),
            Err(Error::TransportFailure("reset by peer".to_string())),
        ]),
        Err(Error::TransportFailure("refused".to_string())),
        Err(Error::TransportFailure("refused".to_string())),
        Ok(vec![Ok(RegistryEvent::Reset(vec![svc_b()]))]),
    ]);
    let attempts = feed.attempts.clone();

    let (signal, drain) = drain::channel();
    let watcher = tokio::spawn(
        Watcher::new("registry", feed, index)
            .with_backoff(fast_backoff())
            .run(drain),
    );

    until(|| attempts.load(Ordering::SeqCst) >= 6).await;
    let b = table.lookup("/svc/b/x").expect("route survives disconnects");
    assert_eq!(b.targets[0].to_string(), "10.0.0.2:8080");
    assert!(table.lookup("/relative").is_none());

    signal.drain().await;
    watcher.await.unwrap();
}

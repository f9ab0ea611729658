use bytes::Bytes;
use futures::{future, Future};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use std::{fmt::Display, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::watch,
    time::{self, Duration},
};
use tracing::{debug, info, instrument, warn, Instrument};

type Body = Full<Bytes>;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
struct Admin {
    ready: watch::Receiver<bool>,
    registry: Arc<Registry>,
}

/// Serves `/live`, `/ready` and `/metrics` until `drain` is signaled.
#[instrument(skip_all, fields(%addr))]
pub async fn serve(
    addr: SocketAddr,
    ready: watch::Receiver<bool>,
    registry: Registry,
    drain: drain::Watch,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP admin server listening");

    let admin = Admin {
        ready,
        registry: Arc::new(registry),
    };
    tokio::pin! {
        let shutdown = drain.signaled();
    }
    loop {
        let (socket, client) = tokio::select! {
            accepted = accept(|| listener.accept()) => accepted,
            _ = (&mut shutdown) => return Ok(()),
        };

        let admin = admin.clone();
        let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
            future::ok::<_, hyper::Error>(admin.handle(&req))
        });
        tokio::spawn(
            async move {
                if let Err(error) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(socket), svc)
                    .await
                {
                    debug!(%error, "Admin connection failed");
                }
            }
            .instrument(tracing::debug_span!("admin", %client)),
        );
    }
}

/// Retries `accept` until it yields a connection, pausing after each
/// failure so that a persistent error does not spin the loop.
async fn accept<T, E, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(error) => {
                warn!(%error, "Failed to accept admin connection");
                time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

impl Admin {
    fn handle(&self, req: &Request<Incoming>) -> Response<Body> {
        if !matches!(*req.method(), Method::GET | Method::HEAD) {
            return respond(StatusCode::METHOD_NOT_ALLOWED, "");
        }
        match req.uri().path() {
            "/live" => respond(StatusCode::OK, "live\n"),
            "/ready" => {
                if *self.ready.borrow() {
                    respond(StatusCode::OK, "ready\n")
                } else {
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
                }
            }
            "/metrics" => self.metrics(),
            _ => respond(StatusCode::NOT_FOUND, ""),
        }
    }

    fn metrics(&self) -> Response<Body> {
        let mut out = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut out, &self.registry) {
            warn!(%error, "Failed to encode metrics");
            return respond(StatusCode::INTERNAL_SERVER_ERROR, "");
        }
        let mut rsp = Response::new(Body::from(out));
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            ),
        );
        rsp
    }
}

fn respond(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    if !body.is_empty() {
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain"),
        );
    }
    rsp
}

use crate::identity::{self, ALPN_H2, ALPN_HTTP1};
use bytes::Bytes;
use gatehouse_core::routes::{Protocol, Route, Target};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rand::seq::SliceRandom;
use rustls::{pki_types::ServerName, RootCertStore};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, Instrument};

pub type Body = BoxBody<Bytes, hyper::Error>;

/// Headers that are meaningful only to an HTTP/1 connection and are refused
/// by HTTP/2 peers.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("route has no targets")]
    NoTargets,

    #[error("connecting to {target} timed out")]
    ConnectTimeout { target: Target },

    #[error("connecting to {target}: {source}")]
    Connect {
        target: Target,
        #[source]
        source: std::io::Error,
    },

    #[error("route to {0} requires TLS but no backend trust roots are configured")]
    TlsUnconfigured(Target),

    #[error("invalid server name {0}")]
    ServerName(String),

    #[error("invalid request URI: {0}")]
    Uri(#[from] http::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),
}

/// Sends admitted requests to a route's backends, one connection per
/// request.
#[derive(Clone, Debug)]
pub struct Forwarder {
    connect_timeout: Duration,
    tls: Option<Tls>,
}

#[derive(Clone)]
struct Tls {
    http1: TlsConnector,
    http2: TlsConnector,
}

// === impl Forwarder ===

impl Forwarder {
    /// `roots` verify TLS backends; without them, TLS routes fail.
    pub fn new(connect_timeout: Duration, roots: Option<RootCertStore>) -> anyhow::Result<Self> {
        let tls = match roots {
            Some(roots) => Some(Tls {
                http1: TlsConnector::from(identity::client_config(roots.clone(), ALPN_HTTP1)?),
                http2: TlsConnector::from(identity::client_config(roots, ALPN_H2)?),
            }),
            None => None,
        };
        Ok(Self {
            connect_timeout,
            tls,
        })
    }

    /// Forwards `req` unchanged to one of the route's targets.
    pub async fn forward(
        &self,
        route: &Route,
        req: http::Request<Incoming>,
    ) -> Result<http::Response<Body>, ForwardError> {
        let target = route
            .targets
            .choose(&mut rand::thread_rng())
            .ok_or(ForwardError::NoTargets)?;
        debug!(%target, tls = route.tls, protocol = ?route.protocol, "Forwarding");

        let tcp = match time::timeout(
            self.connect_timeout,
            TcpStream::connect((target.server_name(), target.port)),
        )
        .await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => {
                return Err(ForwardError::Connect {
                    target: target.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ForwardError::ConnectTimeout {
                    target: target.clone(),
                })
            }
        };
        let _ = tcp.set_nodelay(true);

        if !route.tls {
            return send(tcp, route.protocol, target, req).await;
        }

        let tls = self
            .tls
            .as_ref()
            .ok_or_else(|| ForwardError::TlsUnconfigured(target.clone()))?;
        let connector = match route.protocol {
            Protocol::Http1 => &tls.http1,
            Protocol::Http2 => &tls.http2,
        };
        let name = ServerName::try_from(target.server_name().to_string())
            .map_err(|_| ForwardError::ServerName(target.server_name().to_string()))?;
        let io = time::timeout(self.connect_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| ForwardError::ConnectTimeout {
                target: target.clone(),
            })?
            .map_err(|source| ForwardError::Connect {
                target: target.clone(),
                source,
            })?;
        send(io, route.protocol, target, req).await
    }
}

async fn send<I>(
    io: I,
    protocol: Protocol,
    target: &Target,
    mut req: http::Request<Incoming>,
) -> Result<http::Response<Body>, ForwardError>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = TokioIo::new(io);
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let rsp = match protocol {
        Protocol::Http1 => {
            // HTTP/2 clients send the authority in the URI rather than a
            // host header.
            if !req.headers().contains_key(http::header::HOST) {
                if let Some(authority) = req.uri().authority().map(|a| a.as_str().to_string()) {
                    if let Ok(host) = http::HeaderValue::from_str(&authority) {
                        req.headers_mut().insert(http::header::HOST, host);
                    }
                }
            }
            *req.uri_mut() = http::Uri::builder().path_and_query(path).build()?;
            *req.version_mut() = http::Version::HTTP_11;

            let (mut tx, conn) = hyper::client::conn::http1::handshake(io).await?;
            tokio::spawn(
                async move {
                    if let Err(error) = conn.await {
                        debug!(%error, "Backend connection failed");
                    }
                }
                .in_current_span(),
            );
            tx.send_request(req).await?
        }
        Protocol::Http2 => {
            // HTTP/2 requests carry the authority and scheme.
            let scheme = match req.uri().scheme_str() {
                Some("https") => "https",
                _ => "http",
            };
            *req.uri_mut() = http::Uri::builder()
                .scheme(scheme)
                .authority(target.to_string())
                .path_and_query(path)
                .build()?;
            *req.version_mut() = http::Version::HTTP_2;
            for name in CONNECTION_HEADERS {
                req.headers_mut().remove(*name);
            }

            let (mut tx, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), io).await?;
            tokio::spawn(
                async move {
                    if let Err(error) = conn.await {
                        debug!(%error, "Backend connection failed");
                    }
                }
                .in_current_span(),
            );
            tx.send_request(req).await?
        }
    };
    Ok(rsp.map(|body| body.boxed()))
}

impl std::fmt::Debug for Tls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tls").finish_non_exhaustive()
    }
}

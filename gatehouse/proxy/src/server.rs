use crate::{
    admission::{Admission, Exchange, State},
    forward::{Body, Forwarder},
    identity::{self, Identity},
};
use bytes::Bytes;
use gatehouse_core::{apikey, authz::Authorize, Error};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use rustls::ServerConfig;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    time,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts client connections and admits their requests.
pub struct Gateway<A> {
    admission: Admission<A>,
    forwarder: Forwarder,
    tls: Option<TlsAcceptor>,
}

// === impl Gateway ===

impl<A> Gateway<A>
where
    A: Authorize + 'static,
{
    /// Without `tls`, every connection is unauthenticated and only public
    /// routes are reachable.
    pub fn new(admission: Admission<A>, forwarder: Forwarder, tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            admission,
            forwarder,
            tls: tls.map(TlsAcceptor::from),
        }
    }

    /// Serves connections until `drain` is signaled, then lets open
    /// connections finish their in-flight requests.
    pub async fn serve(self, listener: TcpListener, drain: drain::Watch) {
        let gateway = Arc::new(self);
        tokio::pin! {
            let shutdown = drain.clone().signaled();
        }

        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((socket, client)) => {
                        let conn = gateway.clone().connection(socket, drain.clone());
                        tokio::spawn(conn.instrument(info_span!("conn", %client)));
                    }
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        time::sleep(Duration::from_millis(10)).await;
                    }
                },

                _ = (&mut shutdown) => {
                    info!("Gateway stopped accepting connections");
                    return;
                }
            }
        }
    }

    async fn connection(self: Arc<Self>, socket: TcpStream, drain: drain::Watch) {
        let mut state = State::Connecting;
        let _ = socket.set_nodelay(true);

        let Some(acceptor) = self.tls.clone() else {
            state.advance(State::Unauthenticated);
            self.serve_http(socket, None, drain).await;
            state.advance(State::Closed);
            return;
        };

        state.advance(State::TlsHandshake);
        let tls = match time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(error)) => {
                debug!(%error, "TLS handshake failed");
                state.advance(State::Closed);
                return;
            }
            Err(_) => {
                debug!("TLS handshake timed out");
                state.advance(State::Closed);
                return;
            }
        };

        let identity = identity::peer_identity(tls.get_ref().1.peer_certificates());
        state.advance(State::established(identity.as_ref()));
        debug!(identity = identity.as_deref().unwrap_or("-"), "Connection established");
        self.serve_http(tls, identity, drain).await;
        state.advance(State::Closed);
    }

    async fn serve_http<I>(self: &Arc<Self>, io: I, identity: Option<Identity>, drain: drain::Watch)
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let gateway = self.clone();
        let svc = hyper::service::service_fn(move |req| {
            let gateway = gateway.clone();
            let identity = identity.clone();
            async move { Ok::<_, Infallible>(gateway.handle(identity, req).await) }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(io), svc);
        tokio::pin!(conn);
        let res = tokio::select! {
            res = conn.as_mut() => res,
            release = drain.signaled() => {
                conn.as_mut().graceful_shutdown();
                release.release_after(conn).await
            }
        };
        if let Err(error) = res {
            debug!(%error, "Connection closed with an error");
        }
    }

    async fn handle(&self, identity: Option<Identity>, mut req: http::Request<Incoming>) -> http::Response<Body> {
        let api_key = req
            .headers()
            .get(apikey::HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut exchange = Exchange::new(identity).with_api_key(api_key);
        let path = req.uri().path().to_string();

        let rsp = match self.admission.admit(&mut exchange, &path).await {
            Ok(admitted) => match set_path(req.uri_mut(), &admitted.path) {
                Ok(()) => match self.forwarder.forward(&admitted.route, req).await {
                    Ok(rsp) => rsp,
                    Err(error) => {
                        warn!(path = %admitted.path, %error, "Failed to forward");
                        self.admission.metrics().upstream_error();
                        respond(http::StatusCode::BAD_GATEWAY)
                    }
                },
                Err(error) => {
                    debug!(%path, %error, "Invalid canonical path");
                    respond(http::StatusCode::BAD_REQUEST)
                }
            },
            Err(rejection) => {
                let status = rejection.status();
                debug!(%path, %status, error = %Error::from(rejection), "Rejected");
                respond(status)
            }
        };

        exchange.close();
        rsp
    }
}

/// Replaces the path of `uri`, keeping its query.
fn set_path(uri: &mut http::Uri, path: &str) -> Result<(), http::Error> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = std::mem::take(uri).into_parts();
    parts.path_and_query = Some(path_and_query.parse::<http::uri::PathAndQuery>()?);
    *uri = http::Uri::from_parts(parts)?;
    Ok(())
}

fn respond(status: http::StatusCode) -> http::Response<Body> {
    let reason = status.canonical_reason().unwrap_or_default();
    let body = Full::new(Bytes::from_static(reason.as_bytes()))
        .map_err(|never| match never {})
        .boxed();
    let mut rsp = http::Response::new(body);
    *rsp.status_mut() = status;
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_replaced_and_queries_kept() {
        let mut uri = "/svc/./a/x?q=1".parse::<http::Uri>().unwrap();
        set_path(&mut uri, "/svc/a/x").unwrap();
        assert_eq!(uri.to_string(), "/svc/a/x?q=1");

        let mut uri = "http://gateway.test/x/../y".parse::<http::Uri>().unwrap();
        set_path(&mut uri, "/y").unwrap();
        assert_eq!(uri.to_string(), "http://gateway.test/y");
    }
}

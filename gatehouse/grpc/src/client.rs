use crate::api::{self, authorization_client::AuthorizationClient, authorize_response};
use anyhow::{Context, Result};
use chrono::DateTime;
use gatehouse_core::{
    authz::{Authorization, Authorize},
    Error,
};
use parking_lot::Mutex;
use std::{sync::Arc, sync::mpsc, time::Duration};
use tokio::{runtime::Handle, sync::OnceCell, time};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// e.g. `https://authz.example.internal:8090`.
    pub addr: String,
    pub tls: Option<ClientTlsConfig>,
    pub connect_timeout: Duration,
    /// Bounds every authorization call, including connection setup.
    pub request_timeout: Duration,
    /// How long `shutdown` waits for in-flight calls.
    pub shutdown_grace: Duration,
}

/// The gateway's view of the authorization service.
///
/// The channel is established by the first call that needs it; concurrent
/// first callers share a single connection attempt. Every failure mode
/// (transport error, service error, timeout, shutdown) is reported as
/// [`Error::AuthorizationUnavailable`] so callers can fail closed.
#[derive(Clone, Debug)]
pub struct AuthzClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    channel: OnceCell<AuthorizationClient<Channel>>,
    request_timeout: Duration,
    shutdown_grace: Duration,
    runtime: Handle,
    /// Cloned by each in-flight call; `None` once shutdown begins.
    open: Mutex<Option<drain::Watch>>,
    signal: Mutex<Option<drain::Signal>>,
    abort: CancellationToken,
}

// === impl ClientConfig ===

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// === impl AuthzClient ===

impl AuthzClient {
    /// Must be called from within a tokio runtime; blocking calls are
    /// executed on that runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let ClientConfig {
            addr,
            tls,
            connect_timeout,
            request_timeout,
            shutdown_grace,
        } = config;

        let mut endpoint = Endpoint::from_shared(addr.clone())
            .with_context(|| format!("invalid authorization service address {addr}"))?
            .connect_timeout(connect_timeout);
        if let Some(tls) = tls {
            endpoint = endpoint
                .tls_config(tls)
                .context("configuring authorization client TLS")?;
        }
        let runtime = Handle::try_current().context("an async runtime is required")?;

        let (signal, open) = drain::channel();
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                channel: OnceCell::new(),
                request_timeout,
                shutdown_grace,
                runtime,
                open: Mutex::new(Some(open)),
                signal: Mutex::new(Some(signal)),
                abort: CancellationToken::new(),
            }),
        })
    }

    /// Asks whether `subject` holds every one of `permissions`.
    pub async fn authorize(
        &self,
        subject: &str,
        permissions: &[String],
    ) -> Result<Authorization, Error> {
        let Some(_inflight) = self.inner.open.lock().clone() else {
            return Err(unavailable("client is shut down"));
        };

        tokio::select! {
            res = time::timeout(self.inner.request_timeout, self.call(subject, permissions)) => {
                match res {
                    Ok(res) => res,
                    Err(_) => Err(unavailable("request timed out")),
                }
            }
            _ = self.inner.abort.cancelled() => Err(unavailable("client is shut down")),
        }
    }

    /// Like [`AuthzClient::authorize`], for callers outside the runtime.
    ///
    /// Must not be called from an async task.
    pub fn authorize_blocking(
        &self,
        subject: &str,
        permissions: &[String],
    ) -> Result<Authorization, Error> {
        let (tx, rx) = mpsc::sync_channel(1);
        let client = self.clone();
        let subject = subject.to_string();
        let permissions = permissions.to_vec();
        self.inner.runtime.spawn(async move {
            let _ = tx.send(client.authorize(&subject, &permissions).await);
        });

        // The call bounds itself; this only guards against a stalled runtime.
        rx.recv_timeout(self.inner.request_timeout + Duration::from_secs(1))
            .unwrap_or_else(|_| Err(unavailable("request timed out")))
    }

    /// Stops accepting calls and waits for in-flight calls to complete.
    /// Calls still pending after the grace period are aborted.
    pub async fn shutdown(&self) {
        drop(self.inner.open.lock().take());
        let Some(signal) = self.inner.signal.lock().take() else {
            return;
        };

        if time::timeout(self.inner.shutdown_grace, signal.drain())
            .await
            .is_err()
        {
            warn!(grace = ?self.inner.shutdown_grace, "Aborting in-flight authorization calls");
            self.inner.abort.cancel();
        } else {
            info!("Authorization client drained");
        }
    }

    async fn call(&self, subject: &str, permissions: &[String]) -> Result<Authorization, Error> {
        let mut client = self.client().await?.clone();
        let rsp = client
            .authorize(api::AuthorizeRequest {
                subject_id: subject.to_string(),
                permissions: permissions.to_vec(),
            })
            .await
            .map_err(|status| unavailable(status.message()))?
            .into_inner();

        match rsp.outcome {
            Some(authorize_response::Outcome::Success(api::AuthorizeSuccess {
                permissions: granted,
                cache_ttl,
            })) => {
                let mut authz = Authorization::from_requested(permissions, |p| {
                    granted.get(p).copied().unwrap_or(false)
                });
                authz.cache_ttl = DateTime::from_timestamp(cache_ttl, 0);
                Ok(authz)
            }
            Some(authorize_response::Outcome::Error(api::AuthorizeError { message })) => {
                Err(unavailable(&message))
            }
            None => Err(unavailable("empty response")),
        }
    }

    async fn client(&self) -> Result<&AuthorizationClient<Channel>, Error> {
        self.inner
            .channel
            .get_or_try_init(|| async {
                debug!(uri = %self.inner.endpoint.uri(), "Connecting to authorization service");
                let channel = self.inner.endpoint.connect().await?;
                Ok::<_, tonic::transport::Error>(AuthorizationClient::new(channel))
            })
            .await
            .map_err(|error| unavailable(&error.to_string()))
    }
}

#[async_trait::async_trait]
impl Authorize for AuthzClient {
    async fn authorize(
        &self,
        subject: &str,
        permissions: &[String],
    ) -> Result<Authorization, Error> {
        AuthzClient::authorize(self, subject, permissions).await
    }
}

fn unavailable(reason: &str) -> Error {
    Error::AuthorizationUnavailable(reason.to_string())
}

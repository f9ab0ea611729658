use crate::{admin, routes, shutdown, tls::ClientTlsArgs};
use anyhow::{bail, Context, Result};
use gatehouse_grpc::{AuthzClient, ClientConfig, RegistryFeedClient};
use gatehouse_index::{Backoff, Index, RouteTable, Watcher};
use gatehouse_proxy::{identity, Admission, AdmissionMetrics, Forwarder, Gateway};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::watch,
    time::{self, Duration},
};
use tonic::transport::Endpoint;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, clap::Args)]
pub(crate) struct GatewayArgs {
    #[clap(long, default_value = "0.0.0.0:8443", env = "GATEHOUSE_PROXY_ADDR")]
    proxy_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9991", env = "GATEHOUSE_ADMIN_ADDR")]
    admin_addr: SocketAddr,

    /// JSON file of static routes, loaded once at startup.
    #[clap(long, env = "GATEHOUSE_ROUTES")]
    routes: PathBuf,

    #[clap(
        long,
        default_value = "https://127.0.0.1:8090",
        env = "GATEHOUSE_AUTHZ_ADDR"
    )]
    authz_addr: String,

    /// A registry to follow, as `namespace=url`. May be repeated; each
    /// namespace owns the routes its registry publishes.
    #[clap(long = "registry-addr")]
    registry_addrs: Vec<RegistryAddr>,

    /// Gateway certificate chain (PEM). Required unless `--insecure`.
    #[clap(long, env = "GATEHOUSE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[clap(long, env = "GATEHOUSE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Trust roots for client certificates.
    #[clap(long, env = "GATEHOUSE_CLIENT_CA", requires = "tls_cert")]
    client_ca: Option<PathBuf>,

    /// Serves clients in plaintext when no certificate is configured. Only
    /// public routes are reachable then.
    #[clap(long, conflicts_with = "tls_cert")]
    insecure: bool,

    #[clap(flatten)]
    authz_tls: ClientTlsArgs,

    /// Trust roots for backends on TLS routes.
    #[clap(long, env = "GATEHOUSE_UPSTREAM_CA")]
    upstream_ca: Option<PathBuf>,

    #[clap(long, default_value = "2000")]
    authz_timeout_ms: u64,

    #[clap(long, default_value = "1000")]
    connect_timeout_ms: u64,

    #[clap(long, default_value = "10000")]
    shutdown_grace_ms: u64,

    #[clap(long, default_value = "30000")]
    backoff_max_ms: u64,
}

#[derive(Clone, Debug)]
struct RegistryAddr {
    namespace: String,
    url: String,
}

impl GatewayArgs {
    pub(crate) async fn run(self) -> Result<()> {
        let Self {
            proxy_addr,
            admin_addr,
            routes,
            authz_addr,
            registry_addrs,
            tls_cert,
            tls_key,
            client_ca,
            insecure,
            authz_tls,
            upstream_ca,
            authz_timeout_ms,
            connect_timeout_ms,
            shutdown_grace_ms,
            backoff_max_ms,
        } = self;
        let authz_timeout = Duration::from_millis(authz_timeout_ms);
        let connect_timeout = Duration::from_millis(connect_timeout_ms);
        let shutdown_grace = Duration::from_millis(shutdown_grace_ms);

        // An invalid routes file aborts startup.
        let static_routes = routes::load(&routes).await?;
        let table = Arc::new(RouteTable::new());
        let index = Index::shared(table.clone(), static_routes);

        let mut prom = Registry::default();
        gatehouse_index::metrics::register(prom.sub_registry_with_prefix("route_index"), index.clone());
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("gateway"));

        let server_tls = match tls_cert.as_deref().zip(tls_key.as_deref()) {
            Some((cert, key)) => {
                let roots = client_ca.as_deref().map(identity::load_roots).transpose()?;
                if roots.is_none() {
                    warn!("No client CA configured; only public routes are reachable");
                }
                Some(identity::server_config(
                    identity::load_certs(cert)?,
                    identity::load_key(key)?,
                    roots,
                )?)
            }
            None if insecure => {
                warn!("No gateway certificate configured; serving plaintext");
                None
            }
            None => bail!("a gateway certificate is required; pass --tls-cert and --tls-key, or --insecure"),
        };
        let upstream_roots = upstream_ca.as_deref().map(identity::load_roots).transpose()?;
        let forwarder = Forwarder::new(connect_timeout, upstream_roots)?;

        let authz = AuthzClient::new(ClientConfig {
            tls: authz_tls.load(&authz_addr).await?,
            connect_timeout,
            request_timeout: authz_timeout,
            shutdown_grace,
            ..ClientConfig::new(authz_addr)
        })?;
        let admission = Admission::new(table, authz.clone(), authz_timeout, metrics);

        let (signal, drain) = drain::channel();

        let backoff = Backoff {
            max: Duration::from_millis(backoff_max_ms),
            ..Backoff::default()
        };
        let backoff = Backoff {
            min: backoff.min.min(backoff.max),
            ..backoff
        };
        for RegistryAddr { namespace, url } in registry_addrs {
            let mut endpoint = Endpoint::from_shared(url.clone())
                .with_context(|| format!("invalid registry address {url}"))?
                .connect_timeout(connect_timeout);
            if let Some(tls) = authz_tls.load(&url).await? {
                endpoint = endpoint.tls_config(tls)?;
            }
            let watcher = Watcher::new(namespace.clone(), RegistryFeedClient::new(endpoint), index.clone())
                .with_backoff(backoff.clone());
            tokio::spawn(
                watcher
                    .run(drain.clone())
                    .instrument(info_span!("registry", ns = %namespace)),
            );
        }

        let listener = TcpListener::bind(proxy_addr).await?;
        info!(addr = %listener.local_addr()?, "Gateway listening");
        let mut gateway = tokio::spawn(
            Gateway::new(admission, forwarder, server_tls)
                .serve(listener, drain.clone())
                .instrument(info_span!("gateway")),
        );

        // Static routes are already published, so traffic can be admitted.
        let (ready_tx, ready_rx) = watch::channel(false);
        let mut admin = tokio::spawn(admin::serve(admin_addr, ready_rx, prom, drain));
        ready_tx.send_replace(true);

        tokio::select! {
            res = shutdown::signal() => res?,
            res = &mut gateway => {
                res?;
                bail!("gateway stopped unexpectedly");
            }
            res = &mut admin => {
                res??;
                bail!("admin server stopped unexpectedly");
            }
        }

        ready_tx.send_replace(false);
        if time::timeout(shutdown_grace, signal.drain()).await.is_err() {
            warn!(grace = ?shutdown_grace, "Connections did not finish within the shutdown grace period");
        }
        authz.shutdown().await;
        info!("Shut down");
        Ok(())
    }
}

impl FromStr for RegistryAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((namespace, url)) if !namespace.is_empty() && !url.is_empty() => Ok(Self {
                namespace: namespace.to_string(),
                url: url.to_string(),
            }),
            _ => bail!("invalid registry {s:?}; expected namespace=url"),
        }
    }
}

use crate::{admin, shutdown, tls};
use anyhow::{bail, Result};
use futures::prelude::*;
use gatehouse_core::{
    authz::{AuthorizationGraph, InMemoryStore},
    registry::InMemoryDeployments,
};
use gatehouse_grpc::{ApiKeyServer, AuthzServer, DeploymentRegistry, GrpcServerMetricsFamily};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::watch;
use tonic::transport::{Server, ServerTlsConfig};
use tracing::{info, info_span, Instrument};

#[derive(Debug, clap::Args)]
pub(crate) struct AuthzArgs {
    #[clap(long, default_value = "0.0.0.0:8090", env = "GATEHOUSE_GRPC_ADDR")]
    grpc_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9990", env = "GATEHOUSE_ADMIN_ADDR")]
    admin_addr: SocketAddr,

    /// Server certificate chain (PEM). Required unless `--insecure`.
    #[clap(long, env = "GATEHOUSE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[clap(long, env = "GATEHOUSE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Requires clients to present a certificate issued by this CA.
    #[clap(long, env = "GATEHOUSE_CLIENT_CA", requires = "tls_cert")]
    client_ca: Option<PathBuf>,

    /// Serves plaintext when no certificate is configured.
    #[clap(long, conflicts_with = "tls_cert")]
    insecure: bool,
}

impl AuthzArgs {
    pub(crate) async fn run(self) -> Result<()> {
        let Self {
            grpc_addr,
            admin_addr,
            tls_cert,
            tls_key,
            client_ca,
            insecure,
        } = self;

        let identity = tls_cert.as_deref().zip(tls_key.as_deref());
        let tls = tls::server_or_plaintext(identity, client_ca.as_deref(), insecure).await?;

        let mut prom = Registry::default();
        let metrics = GrpcServerMetricsFamily::register(prom.sub_registry_with_prefix("grpc_server"));

        // Grants, API keys and deployments live in memory for the life of
        // the process.
        let graph = Arc::new(AuthorizationGraph::new(InMemoryStore::new()));
        let deployments = Arc::new(InMemoryDeployments::default());

        let (signal, drain) = drain::channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let mut admin = tokio::spawn(admin::serve(admin_addr, ready_rx, prom, drain.clone()));
        let mut grpc = tokio::spawn(
            grpc(grpc_addr, tls, graph, deployments, metrics, drain)
                .instrument(info_span!("grpc", port = %grpc_addr.port())),
        );
        ready_tx.send_replace(true);

        tokio::select! {
            res = shutdown::signal() => res?,
            res = &mut grpc => {
                res??;
                bail!("gRPC server stopped unexpectedly");
            }
            res = &mut admin => {
                res??;
                bail!("admin server stopped unexpectedly");
            }
        }

        signal.drain().await;
        grpc.await??;
        admin.await??;
        info!("Shut down");
        Ok(())
    }
}

async fn grpc(
    addr: SocketAddr,
    tls: Option<ServerTlsConfig>,
    graph: Arc<AuthorizationGraph<InMemoryStore>>,
    deployments: Arc<InMemoryDeployments>,
    metrics: GrpcServerMetricsFamily,
    drain: drain::Watch,
) -> Result<()> {
    let authz_svc = AuthzServer::new(graph.clone(), metrics.clone()).svc();
    let apikey_svc = ApiKeyServer::new(graph, metrics.clone()).svc();
    let registry_svc = DeploymentRegistry::new(deployments, drain.clone(), metrics).svc();

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = builder
            .add_service(authz_svc)
            .add_service(apikey_svc)
            .add_service(registry_svc)
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "gatehouse gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

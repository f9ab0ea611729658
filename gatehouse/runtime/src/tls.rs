use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use tracing::warn;

/// TLS settings for a gRPC server. With a client CA, clients must present a
/// certificate it issued.
pub(crate) async fn server(
    cert: &Path,
    key: &Path,
    client_ca: Option<&Path>,
) -> Result<ServerTlsConfig> {
    let identity = Identity::from_pem(read(cert).await?, read(key).await?);
    let mut config = ServerTlsConfig::new().identity(identity);
    if let Some(ca) = client_ca {
        config = config.client_ca_root(Certificate::from_pem(read(ca).await?));
    }
    Ok(config)
}

/// The server's TLS settings, or `None` when `insecure` permits serving
/// plaintext because no certificate is configured.
pub(crate) async fn server_or_plaintext(
    identity: Option<(&Path, &Path)>,
    client_ca: Option<&Path>,
    insecure: bool,
) -> Result<Option<ServerTlsConfig>> {
    match identity {
        Some((cert, key)) => {
            if client_ca.is_none() {
                warn!("No client CA configured; clients are not authenticated");
            }
            server(cert, key, client_ca).await.map(Some)
        }
        None if insecure => {
            warn!("No server certificate configured; serving plaintext");
            Ok(None)
        }
        None => bail!("a server certificate is required; pass --tls-cert and --tls-key, or --insecure"),
    }
}

/// TLS settings for a gRPC client, presenting `identity` when given as a
/// `(cert, key)` pair.
pub(crate) async fn client(
    ca: Option<&Path>,
    identity: Option<(&Path, &Path)>,
) -> Result<ClientTlsConfig> {
    let mut config = ClientTlsConfig::new();
    if let Some(ca) = ca {
        config = config.ca_certificate(Certificate::from_pem(read(ca).await?));
    }
    if let Some((cert, key)) = identity {
        config = config.identity(Identity::from_pem(read(cert).await?, read(key).await?));
    }
    Ok(config)
}

/// The client TLS options shared by the gateway and the management CLI.
#[derive(Clone, Debug, clap::Args)]
pub(crate) struct ClientTlsArgs {
    /// Trust roots for the authorization service's certificate.
    #[clap(long, env = "GATEHOUSE_AUTHZ_CA")]
    pub authz_ca: Option<PathBuf>,

    /// Client certificate presented to the authorization service.
    #[clap(long, env = "GATEHOUSE_AUTHZ_CERT", requires = "authz_key")]
    pub authz_cert: Option<PathBuf>,

    #[clap(long, env = "GATEHOUSE_AUTHZ_KEY", requires = "authz_cert")]
    pub authz_key: Option<PathBuf>,

    /// Permits `http://` addresses for the authorization service and
    /// registries.
    #[clap(long)]
    pub authz_insecure: bool,
}

impl ClientTlsArgs {
    /// Returns `None` when the service is reached without TLS, which is only
    /// permitted with `--authz-insecure`.
    pub(crate) async fn load(&self, addr: &str) -> Result<Option<ClientTlsConfig>> {
        if addr.starts_with("https://") {
            let identity = self.authz_cert.as_deref().zip(self.authz_key.as_deref());
            return client(self.authz_ca.as_deref(), identity).await.map(Some);
        }
        if !self.authz_insecure {
            bail!("refusing to connect to {addr} without TLS; use an https:// address or pass --authz-insecure");
        }
        warn!(%addr, "Connecting without TLS");
        Ok(None)
    }
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plaintext_clients_must_opt_in() {
        let mut args = ClientTlsArgs {
            authz_ca: Some("/nonexistent/ca.pem".into()),
            authz_cert: None,
            authz_key: None,
            authz_insecure: false,
        };
        assert!(args.load("http://127.0.0.1:8090").await.is_err());
        assert!(args.load("127.0.0.1:8090").await.is_err());
        // https always loads TLS, so a missing CA file fails.
        assert!(args.load("https://authz:8090").await.is_err());

        args.authz_insecure = true;
        assert!(args.load("http://127.0.0.1:8090").await.unwrap().is_none());
        assert!(args.load("https://authz:8090").await.is_err());
    }

    #[tokio::test]
    async fn plaintext_servers_must_opt_in() {
        assert!(server_or_plaintext(None, None, false).await.is_err());
        assert!(server_or_plaintext(None, None, true).await.unwrap().is_none());

        let missing = Path::new("/nonexistent/cert.pem");
        assert!(server_or_plaintext(Some((missing, missing)), None, true)
            .await
            .is_err());
    }
}

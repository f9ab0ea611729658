use chrono::{DateTime, Utc};

/// Short-lived credentials minted for a subject.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM-encoded certificate chain, leaf first.
    pub cert_chain: String,
    /// PEM-encoded private key for the leaf.
    pub private_key: String,
    pub expiration: DateTime<Utc>,
}

/// A certificate authority that mints client identities used for mutual
/// TLS admission.
#[async_trait::async_trait]
pub trait IssueCertificate: Send + Sync {
    async fn certificate(
        &self,
        subject_id: &str,
        data_classification: &str,
    ) -> anyhow::Result<IssuedCertificate>;
}

// The private key is never logged.
impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_chain", &self.cert_chain)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

use crate::api::{self, certificate_authority_client::CertificateAuthorityClient, certificate_response};
use anyhow::{anyhow, bail, Context, Result};
use chrono::DateTime;
use gatehouse_core::ca::{IssueCertificate, IssuedCertificate};
use tonic::transport::Channel;

/// Requests client certificates from a remote certificate authority.
#[derive(Clone, Debug)]
pub struct CaClient {
    client: CertificateAuthorityClient<Channel>,
}

impl CaClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: CertificateAuthorityClient::new(channel),
        }
    }
}

#[async_trait::async_trait]
impl IssueCertificate for CaClient {
    async fn certificate(
        &self,
        subject_id: &str,
        data_classification: &str,
    ) -> Result<IssuedCertificate> {
        let rsp = self
            .client
            .clone()
            .certificate(api::CertificateRequest {
                subject_id: subject_id.to_string(),
                data_classification: data_classification.to_string(),
            })
            .await
            .with_context(|| format!("requesting a certificate for {subject_id}"))?
            .into_inner();

        match rsp.outcome {
            Some(certificate_response::Outcome::Issued(issued)) => {
                let expiration = DateTime::from_timestamp(issued.expiration, 0)
                    .ok_or_else(|| anyhow!("invalid expiration {}", issued.expiration))?;
                Ok(IssuedCertificate {
                    cert_chain: issued.cert_chain,
                    private_key: issued.private_key,
                    expiration,
                })
            }
            Some(certificate_response::Outcome::Error(api::CertificateError { message })) => {
                bail!("certificate authority refused {subject_id}: {message}")
            }
            None => bail!("certificate authority returned an empty response"),
        }
    }
}

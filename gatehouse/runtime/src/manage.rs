use crate::tls::ClientTlsArgs;
use anyhow::{bail, Context, Result};
use gatehouse_core::ca::IssueCertificate;
use gatehouse_grpc::{
    api::{
        self, api_keys_client::ApiKeysClient, authorization_client::AuthorizationClient,
        registry_client::RegistryClient,
    },
    CaClient,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::time::Duration;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, clap::Args)]
pub(crate) struct ManageArgs {
    #[clap(
        long,
        global = true,
        default_value = "https://127.0.0.1:8090",
        env = "GATEHOUSE_AUTHZ_ADDR"
    )]
    addr: String,

    #[clap(flatten)]
    tls: ClientTlsArgs,

    #[clap(long, global = true, default_value = "5000")]
    timeout_ms: u64,

    #[clap(subcommand)]
    op: Op,
}

#[derive(Debug, clap::Subcommand)]
enum Op {
    /// Creates a subject with its initial permissions and roles.
    CreateSubject {
        subject: String,
        #[clap(long, value_delimiter = ',')]
        permissions: Vec<String>,
        #[clap(long, value_delimiter = ',')]
        roles: Vec<String>,
    },
    AddSubjectPermissions {
        subject: String,
        #[clap(required = true)]
        permissions: Vec<String>,
    },
    RemoveSubjectPermissions {
        subject: String,
        #[clap(required = true)]
        permissions: Vec<String>,
    },
    AddSubjectRoles {
        subject: String,
        #[clap(required = true)]
        roles: Vec<String>,
    },
    RemoveSubjectRoles {
        subject: String,
        #[clap(required = true)]
        roles: Vec<String>,
    },
    CreateRole {
        role: String,
        permissions: Vec<String>,
    },
    AddRolePermissions {
        role: String,
        #[clap(required = true)]
        permissions: Vec<String>,
    },
    RemoveRolePermissions {
        role: String,
        #[clap(required = true)]
        permissions: Vec<String>,
    },
    /// Prints a subject's direct permissions and roles.
    ListSubject { subject: String },
    ListRole { role: String },
    /// Asks whether a subject holds every listed permission.
    Authorize {
        subject: String,
        #[clap(required = true)]
        permissions: Vec<String>,
    },
    /// Routes a path prefix to a service's hosts.
    Register {
        service: String,
        #[clap(long)]
        path: String,
        #[clap(long = "host", required = true)]
        hosts: Vec<String>,
        #[clap(long)]
        port: u16,
        #[clap(long)]
        tls: bool,
        #[clap(long)]
        http2: bool,
        /// Omit for a public route.
        #[clap(long)]
        permission: Option<String>,
    },
    Deregister { deployment_id: String },
    /// Issues an API key for a team's service.
    GenerateApiKey {
        team: String,
        service: String,
        /// Labels the key's holder.
        #[clap(long)]
        name: String,
    },
    RevokeApiKey {
        key: String,
        #[clap(long)]
        team: String,
        #[clap(long)]
        service: String,
    },
    /// Requests a client certificate from the certificate authority.
    Certificate {
        subject: String,
        #[clap(long, default_value = "internal")]
        data_classification: String,
        #[clap(long, env = "GATEHOUSE_CA_ADDR")]
        ca_addr: String,
    },
}

impl ManageArgs {
    pub(crate) async fn run(self) -> Result<()> {
        let Self {
            addr,
            tls,
            timeout_ms,
            op,
        } = self;
        let timeout = Duration::from_millis(timeout_ms);

        let target = match &op {
            Op::Certificate { ca_addr, .. } => ca_addr.clone(),
            _ => addr,
        };
        let mut endpoint = Endpoint::from_shared(target.clone())
            .with_context(|| format!("invalid address {target}"))?
            .timeout(timeout)
            .connect_timeout(timeout);
        if let Some(tls) = tls.load(&target).await? {
            endpoint = endpoint.tls_config(tls)?;
        }
        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("connecting to {target}"))?;

        let out = op.call(channel).await?;
        println!("{}", serde_json::to_string_pretty(&out)?);
        Ok(())
    }
}

impl Op {
    async fn call(self, channel: Channel) -> Result<Value> {
        let mut authz = AuthorizationClient::new(channel.clone());
        let mut registry = RegistryClient::new(channel.clone());

        let change = match self {
            Self::CreateSubject {
                subject,
                permissions,
                roles,
            } => {
                authz
                    .create_subject_permissions(api::CreateSubjectRequest {
                        subject_id: subject,
                        permissions,
                        roles,
                    })
                    .await?
            }
            Self::AddSubjectPermissions {
                subject,
                permissions,
            } => {
                authz
                    .add_subject_permissions(items(subject, permissions))
                    .await?
            }
            Self::RemoveSubjectPermissions {
                subject,
                permissions,
            } => {
                authz
                    .remove_subject_permissions(items(subject, permissions))
                    .await?
            }
            Self::AddSubjectRoles { subject, roles } => {
                authz.add_subject_roles(items(subject, roles)).await?
            }
            Self::RemoveSubjectRoles { subject, roles } => {
                authz.remove_subject_roles(items(subject, roles)).await?
            }
            Self::CreateRole { role, permissions } => {
                authz
                    .create_role_permissions(api::RolePermissionsRequest {
                        role_id: role,
                        permissions,
                    })
                    .await?
            }
            Self::AddRolePermissions { role, permissions } => {
                authz
                    .add_role_permissions(api::RolePermissionsRequest {
                        role_id: role,
                        permissions,
                    })
                    .await?
            }
            Self::RemoveRolePermissions { role, permissions } => {
                authz
                    .remove_role_permissions(api::RolePermissionsRequest {
                        role_id: role,
                        permissions,
                    })
                    .await?
            }

            Self::ListSubject { subject } => {
                let rsp = authz
                    .list_subject_authz(api::ListSubjectRequest {
                        subject_id: subject,
                    })
                    .await?
                    .into_inner();
                return Ok(json!({
                    "subject": rsp.subject_id,
                    "permissions": rsp.permissions,
                    "roles": rsp.roles,
                }));
            }
            Self::ListRole { role } => {
                let rsp = authz
                    .list_role_permissions(api::ListRoleRequest { role_id: role })
                    .await?
                    .into_inner();
                return Ok(json!({
                    "role": rsp.role_id,
                    "permissions": rsp.permissions,
                }));
            }
            Self::Authorize {
                subject,
                permissions,
            } => {
                let rsp = authz
                    .authorize(api::AuthorizeRequest {
                        subject_id: subject.clone(),
                        permissions,
                    })
                    .await?
                    .into_inner();
                return match rsp.outcome {
                    Some(api::authorize_response::Outcome::Success(success)) => {
                        let permissions = success.permissions.into_iter().collect::<BTreeMap<_, _>>();
                        Ok(json!({
                            "subject": subject,
                            "allowed": permissions.values().all(|granted| *granted),
                            "permissions": permissions,
                            "cache_ttl": success.cache_ttl,
                        }))
                    }
                    Some(api::authorize_response::Outcome::Error(api::AuthorizeError { message })) => {
                        bail!("authorization failed: {message}")
                    }
                    None => bail!("authorization service returned an empty response"),
                };
            }

            Self::Register {
                service,
                path,
                hosts,
                port,
                tls,
                http2,
                permission,
            } => {
                let protocol = if http2 {
                    api::Protocol::Http2
                } else {
                    api::Protocol::Http1
                };
                let rsp = registry
                    .start_routing(api::StartRoutingRequest {
                        registration: Some(api::Registration {
                            service_name: service.clone(),
                            path,
                            hosts,
                            port: port.into(),
                            tls,
                            protocol: protocol as i32,
                            permission: permission.unwrap_or_default(),
                        }),
                    })
                    .await?
                    .into_inner();
                return Ok(json!({
                    "service": service,
                    "deployment_id": rsp.deployment_id,
                }));
            }
            Self::Deregister { deployment_id } => {
                let rsp = registry
                    .stop_routing(api::StopRoutingRequest {
                        deployment_id: deployment_id.clone(),
                    })
                    .await?
                    .into_inner();
                return Ok(json!({
                    "deployment_id": deployment_id,
                    "removed": rsp.removed,
                }));
            }

            Self::GenerateApiKey {
                team,
                service,
                name,
            } => {
                let key = ApiKeysClient::new(channel)
                    .generate_api_key(api::KeyRequest {
                        team_name: team,
                        service_name: service,
                        key_name: name,
                    })
                    .await?
                    .into_inner();
                return Ok(json!({
                    "team": key.team_name,
                    "service": key.service_name,
                    "name": key.key_name,
                    "key": key.key,
                }));
            }
            Self::RevokeApiKey { key, team, service } => {
                ApiKeysClient::new(channel)
                    .revoke_api_key(api::ApiKey {
                        team_name: team,
                        key,
                        service_name: service,
                        key_name: String::new(),
                    })
                    .await?
            }

            Self::Certificate {
                subject,
                data_classification,
                ..
            } => {
                let issued = CaClient::new(channel)
                    .certificate(&subject, &data_classification)
                    .await?;
                return Ok(json!({
                    "subject": subject,
                    "cert_chain": issued.cert_chain,
                    "private_key": issued.private_key,
                    "expiration": issued.expiration.to_rfc3339(),
                }));
            }
        };

        let change = change.into_inner();
        Ok(json!({
            "success": change.success,
            "message": change.message,
        }))
    }
}

fn items(subject: String, items: Vec<String>) -> api::SubjectItemsRequest {
    api::SubjectItemsRequest {
        subject_id: subject,
        items,
    }
}

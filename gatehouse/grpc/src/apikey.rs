use crate::{
    api::{
        self,
        api_keys_server::{ApiKeys, ApiKeysServer},
    },
    authz::check_id,
    metrics::GrpcServerMetricsFamily,
};
use gatehouse_core::{
    apikey,
    authz::{AuthorizationGraph, GrantStore, Mutation},
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{info, warn};

const SERVICE: &str = "gatehouse.apikey.ApiKeys";

/// Issues and revokes API keys. A key is a subject in the same
/// [`AuthorizationGraph`] the authorization service answers from.
#[derive(Debug)]
pub struct ApiKeyServer<S> {
    graph: Arc<AuthorizationGraph<S>>,
    metrics: GrpcServerMetricsFamily,
}

type Response<T> = Result<tonic::Response<T>, tonic::Status>;

// === impl ApiKeyServer ===

impl<S> Clone for ApiKeyServer<S> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> ApiKeyServer<S>
where
    S: GrantStore + 'static,
{
    pub fn new(graph: Arc<AuthorizationGraph<S>>, metrics: GrpcServerMetricsFamily) -> Self {
        Self { graph, metrics }
    }

    pub fn svc(self) -> ApiKeysServer<Self> {
        ApiKeysServer::new(self)
    }
}

#[async_trait::async_trait]
impl<S> ApiKeys for ApiKeyServer<S>
where
    S: GrantStore + 'static,
{
    async fn generate_api_key(&self, req: tonic::Request<api::KeyRequest>) -> Response<api::ApiKey> {
        let observer = self.metrics.unary_rpc(SERVICE, "GenerateApiKey").start();
        let api::KeyRequest {
            team_name,
            service_name,
            key_name,
        } = req.into_inner();

        let res = async {
            let permission = grant(&team_name, &service_name)?;
            let key_name = check_id("key name", key_name)?;
            let key = apikey::generate();
            self.graph
                .mutate(Mutation::CreateSubject {
                    subject: key.clone(),
                    permissions: BTreeSet::from([permission]),
                    roles: BTreeSet::new(),
                })
                .await
                .map_err(|error| {
                    warn!(team = %team_name, service = %service_name, %error, "Failed to store API key");
                    tonic::Status::unavailable(error.to_string())
                })?;

            info!(
                team = %team_name,
                service = %service_name,
                %key_name,
                key = %apikey::redact(&key),
                "Generated API key"
            );
            Ok(api::ApiKey {
                team_name,
                key,
                service_name,
                key_name,
            })
        }
        .await;
        observer.respond(res)
    }

    async fn revoke_api_key(&self, req: tonic::Request<api::ApiKey>) -> Response<api::ChangeResult> {
        let observer = self.metrics.unary_rpc(SERVICE, "RevokeApiKey").start();
        let api::ApiKey {
            team_name,
            key,
            service_name,
            ..
        } = req.into_inner();

        let res = async {
            let permission = grant(&team_name, &service_name)?;
            let key = check_id("key", key)?;
            let label = apikey::redact(&key);
            let change = self
                .graph
                .mutate(Mutation::RemoveSubjectPermissions {
                    subject: key,
                    permissions: BTreeSet::from([permission]),
                })
                .await
                .map_err(|error| {
                    warn!(key = %label, %error, "Failed to revoke API key");
                    tonic::Status::unavailable(error.to_string())
                })?;

            info!(team = %team_name, service = %service_name, key = %label, "Revoked API key");
            Ok(api::ChangeResult {
                success: true,
                message: change.to_string(),
            })
        }
        .await;
        observer.respond(res)
    }
}

fn grant(team: &str, service: &str) -> Result<String, tonic::Status> {
    apikey::grant(team, service).map_err(|error| tonic::Status::invalid_argument(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::authz::{Decision, InMemoryStore};

    fn server() -> ApiKeyServer<InMemoryStore> {
        let graph = Arc::new(AuthorizationGraph::new(InMemoryStore::new()));
        ApiKeyServer::new(graph, GrpcServerMetricsFamily::register(&mut Default::default()))
    }

    fn request(team: &str, service: &str) -> tonic::Request<api::KeyRequest> {
        tonic::Request::new(api::KeyRequest {
            team_name: team.to_string(),
            service_name: service.to_string(),
            key_name: "ci".to_string(),
        })
    }

    async fn decide(server: &ApiKeyServer<InMemoryStore>, key: &str, permission: &str) -> Decision {
        server
            .graph
            .authorize(key, &[permission.to_string()])
            .await
            .unwrap()
            .decision()
    }

    #[tokio::test]
    async fn generated_keys_hold_their_service_grant_until_revoked() {
        let server = server();
        let key = server
            .generate_api_key(request("Orders", "checkout"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(key.team_name, "Orders");
        assert_eq!(key.key_name, "ci");
        assert!(!key.key.is_empty());

        assert_eq!(decide(&server, &key.key, "apikey:orders:checkout:*").await, Decision::Allow);
        assert_eq!(decide(&server, &key.key, "apikey:orders:refunds:*").await, Decision::Deny);

        let other = server
            .generate_api_key(request("orders", "checkout"))
            .await
            .unwrap()
            .into_inner();
        assert_ne!(key.key, other.key);

        let rsp = server
            .revoke_api_key(tonic::Request::new(key.clone()))
            .await
            .unwrap()
            .into_inner();
        assert!(rsp.success);
        assert_eq!(decide(&server, &key.key, "apikey:orders:checkout:*").await, Decision::Deny);
        assert_eq!(decide(&server, &other.key, "apikey:orders:checkout:*").await, Decision::Allow);
    }

    #[tokio::test]
    async fn invalid_names_are_refused() {
        let server = server();
        for (team, service) in [("", "checkout"), ("orders", "a:b"), ("or/ders", "checkout")] {
            let status = server.generate_api_key(request(team, service)).await.unwrap_err();
            assert_eq!(status.code(), tonic::Code::InvalidArgument, "{team} {service}");
        }

        let status = server
            .revoke_api_key(tonic::Request::new(api::ApiKey {
                team_name: "orders".to_string(),
                service_name: "checkout".to_string(),
                key: String::new(),
                key_name: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}

use crate::{
    api::{
        self,
        authorization_server::{Authorization, AuthorizationServer},
        authorize_response,
    },
    metrics::GrpcServerMetricsFamily,
};
use chrono::Utc;
use gatehouse_core::{
    authz::{AuthorizationGraph, GrantStore, Mutation},
    Error,
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, warn};

const SERVICE: &str = "gatehouse.authz.Authorization";

/// How long the gateway may reuse an authorization answer.
pub const CACHE_TTL: chrono::Duration = chrono::Duration::minutes(15);

/// Serves authorization decisions and grant management backed by an
/// [`AuthorizationGraph`].
#[derive(Debug)]
pub struct AuthzServer<S> {
    graph: Arc<AuthorizationGraph<S>>,
    metrics: GrpcServerMetricsFamily,
}

type Response<T> = Result<tonic::Response<T>, tonic::Status>;

// === impl AuthzServer ===

impl<S> Clone for AuthzServer<S> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> AuthzServer<S>
where
    S: GrantStore + 'static,
{
    pub fn new(graph: Arc<AuthorizationGraph<S>>, metrics: GrpcServerMetricsFamily) -> Self {
        Self { graph, metrics }
    }

    pub fn svc(self) -> AuthorizationServer<Self> {
        AuthorizationServer::new(self)
    }

    async fn change(
        &self,
        method: &'static str,
        mutation: Result<Mutation, tonic::Status>,
    ) -> Response<api::ChangeResult> {
        let observer = self.metrics.unary_rpc(SERVICE, method).start();
        let res = match mutation {
            Ok(mutation) => self
                .graph
                .mutate(mutation)
                .await
                .map(|change| api::ChangeResult {
                    success: true,
                    message: change.to_string(),
                })
                .map_err(to_status),
            Err(status) => Err(status),
        };
        observer.respond(res)
    }
}

#[async_trait::async_trait]
impl<S> Authorization for AuthzServer<S>
where
    S: GrantStore + 'static,
{
    async fn authorize(
        &self,
        req: tonic::Request<api::AuthorizeRequest>,
    ) -> Response<api::AuthorizeResponse> {
        let observer = self.metrics.unary_rpc(SERVICE, "Authorize").start();
        let api::AuthorizeRequest {
            subject_id,
            permissions,
        } = req.into_inner();

        let res = async {
            let subject = check_id("subject", subject_id)?;
            if permissions.is_empty() {
                return Err(tonic::Status::invalid_argument(
                    "at least one permission is required",
                ));
            }

            let outcome = match self.graph.authorize(&subject, &permissions).await {
                Ok(authz) => {
                    debug!(%subject, allowed = authz.is_allowed(), "Authorized");
                    authorize_response::Outcome::Success(api::AuthorizeSuccess {
                        permissions: authz.permissions.into_iter().collect(),
                        cache_ttl: (Utc::now() + CACHE_TTL).timestamp(),
                    })
                }
                Err(error) => {
                    warn!(%subject, %error, "Failed to authorize");
                    authorize_response::Outcome::Error(api::AuthorizeError {
                        message: error.to_string(),
                    })
                }
            };
            Ok(api::AuthorizeResponse {
                outcome: Some(outcome),
            })
        }
        .await;
        observer.respond(res)
    }

    async fn create_subject_permissions(
        &self,
        req: tonic::Request<api::CreateSubjectRequest>,
    ) -> Response<api::ChangeResult> {
        let api::CreateSubjectRequest {
            subject_id,
            permissions,
            roles,
        } = req.into_inner();
        let mutation = check_id("subject", subject_id).map(|subject| Mutation::CreateSubject {
            subject,
            permissions: to_set(permissions),
            roles: to_set(roles),
        });
        self.change("CreateSubjectPermissions", mutation).await
    }

    async fn add_subject_permissions(
        &self,
        req: tonic::Request<api::SubjectItemsRequest>,
    ) -> Response<api::ChangeResult> {
        let api::SubjectItemsRequest { subject_id, items } = req.into_inner();
        let mutation =
            check_id("subject", subject_id).map(|subject| Mutation::AddSubjectPermissions {
                subject,
                permissions: to_set(items),
            });
        self.change("AddSubjectPermissions", mutation).await
    }

    async fn remove_subject_permissions(
        &self,
        req: tonic::Request<api::SubjectItemsRequest>,
    ) -> Response<api::ChangeResult> {
        let api::SubjectItemsRequest { subject_id, items } = req.into_inner();
        let mutation =
            check_id("subject", subject_id).map(|subject| Mutation::RemoveSubjectPermissions {
                subject,
                permissions: to_set(items),
            });
        self.change("RemoveSubjectPermissions", mutation).await
    }

    async fn add_subject_roles(
        &self,
        req: tonic::Request<api::SubjectItemsRequest>,
    ) -> Response<api::ChangeResult> {
        let api::SubjectItemsRequest { subject_id, items } = req.into_inner();
        let mutation = check_id("subject", subject_id).map(|subject| Mutation::AddSubjectRoles {
            subject,
            roles: to_set(items),
        });
        self.change("AddSubjectRoles", mutation).await
    }

    async fn remove_subject_roles(
        &self,
        req: tonic::Request<api::SubjectItemsRequest>,
    ) -> Response<api::ChangeResult> {
        let api::SubjectItemsRequest { subject_id, items } = req.into_inner();
        let mutation =
            check_id("subject", subject_id).map(|subject| Mutation::RemoveSubjectRoles {
                subject,
                roles: to_set(items),
            });
        self.change("RemoveSubjectRoles", mutation).await
    }

    async fn create_role_permissions(
        &self,
        req: tonic::Request<api::RolePermissionsRequest>,
    ) -> Response<api::ChangeResult> {
        let api::RolePermissionsRequest {
            role_id,
            permissions,
        } = req.into_inner();
        let mutation = check_id("role", role_id).map(|role| Mutation::CreateRole {
            role,
            permissions: to_set(permissions),
        });
        self.change("CreateRolePermissions", mutation).await
    }

    async fn add_role_permissions(
        &self,
        req: tonic::Request<api::RolePermissionsRequest>,
    ) -> Response<api::ChangeResult> {
        let api::RolePermissionsRequest {
            role_id,
            permissions,
        } = req.into_inner();
        let mutation = check_id("role", role_id).map(|role| Mutation::AddRolePermissions {
            role,
            permissions: to_set(permissions),
        });
        self.change("AddRolePermissions", mutation).await
    }

    async fn remove_role_permissions(
        &self,
        req: tonic::Request<api::RolePermissionsRequest>,
    ) -> Response<api::ChangeResult> {
        let api::RolePermissionsRequest {
            role_id,
            permissions,
        } = req.into_inner();
        let mutation = check_id("role", role_id).map(|role| Mutation::RemoveRolePermissions {
            role,
            permissions: to_set(permissions),
        });
        self.change("RemoveRolePermissions", mutation).await
    }

    async fn list_subject_authz(
        &self,
        req: tonic::Request<api::ListSubjectRequest>,
    ) -> Response<api::SubjectAuthz> {
        let observer = self.metrics.unary_rpc(SERVICE, "ListSubjectAuthz").start();
        let res = async {
            let subject = check_id("subject", req.into_inner().subject_id)?;
            let grants = self
                .graph
                .list_subject_authz(&subject)
                .await
                .map_err(to_status)?;
            Ok(api::SubjectAuthz {
                subject_id: subject,
                permissions: grants.permissions.into_iter().collect(),
                roles: grants.roles.into_iter().collect(),
            })
        }
        .await;
        observer.respond(res)
    }

    async fn list_role_permissions(
        &self,
        req: tonic::Request<api::ListRoleRequest>,
    ) -> Response<api::RoleAuthz> {
        let observer = self
            .metrics
            .unary_rpc(SERVICE, "ListRolePermissions")
            .start();
        let res = async {
            let role = check_id("role", req.into_inner().role_id)?;
            let grants = self
                .graph
                .list_role_permissions(&role)
                .await
                .map_err(to_status)?;
            Ok(api::RoleAuthz {
                role_id: role,
                permissions: grants.permissions.into_iter().collect(),
            })
        }
        .await;
        observer.respond(res)
    }
}

/// Ids are stored exactly as given; only blank ids are refused.
pub(crate) fn check_id(kind: &str, id: String) -> Result<String, tonic::Status> {
    if id.trim().is_empty() {
        return Err(tonic::Status::invalid_argument(format!(
            "a {kind} id is required"
        )));
    }
    Ok(id)
}

fn to_set(items: Vec<String>) -> BTreeSet<String> {
    items.into_iter().collect()
}

pub(crate) fn to_status(error: Error) -> tonic::Status {
    match error {
        Error::BackingStoreUnavailable(_) => tonic::Status::unavailable(error.to_string()),
        error => tonic::Status::internal(error.to_string()),
    }
}

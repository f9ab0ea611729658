use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::api::{input}"))
        .output_type(format!("crate::api::{output}"))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let authorization = Service::builder()
        .name("Authorization")
        .package("gatehouse.authz")
        .method(unary("authorize", "Authorize", "AuthorizeRequest", "AuthorizeResponse"))
        .method(unary(
            "create_subject_permissions",
            "CreateSubjectPermissions",
            "CreateSubjectRequest",
            "ChangeResult",
        ))
        .method(unary(
            "add_subject_permissions",
            "AddSubjectPermissions",
            "SubjectItemsRequest",
            "ChangeResult",
        ))
        .method(unary(
            "remove_subject_permissions",
            "RemoveSubjectPermissions",
            "SubjectItemsRequest",
            "ChangeResult",
        ))
        .method(unary(
            "add_subject_roles",
            "AddSubjectRoles",
            "SubjectItemsRequest",
            "ChangeResult",
        ))
        .method(unary(
            "remove_subject_roles",
            "RemoveSubjectRoles",
            "SubjectItemsRequest",
            "ChangeResult",
        ))
        .method(unary(
            "create_role_permissions",
            "CreateRolePermissions",
            "RolePermissionsRequest",
            "ChangeResult",
        ))
        .method(unary(
            "add_role_permissions",
            "AddRolePermissions",
            "RolePermissionsRequest",
            "ChangeResult",
        ))
        .method(unary(
            "remove_role_permissions",
            "RemoveRolePermissions",
            "RolePermissionsRequest",
            "ChangeResult",
        ))
        .method(unary(
            "list_subject_authz",
            "ListSubjectAuthz",
            "ListSubjectRequest",
            "SubjectAuthz",
        ))
        .method(unary(
            "list_role_permissions",
            "ListRolePermissions",
            "ListRoleRequest",
            "RoleAuthz",
        ))
        .build();

    let registry = Service::builder()
        .name("Registry")
        .package("gatehouse.registry")
        .method(unary(
            "start_routing",
            "StartRouting",
            "StartRoutingRequest",
            "DeployedService",
        ))
        .method(unary(
            "stop_routing",
            "StopRouting",
            "StopRoutingRequest",
            "StopRoutingResponse",
        ))
        .method(
            Method::builder()
                .name("watch")
                .route_name("Watch")
                .input_type("crate::api::WatchRequest")
                .output_type("crate::api::RegistryUpdate")
                .codec_path(CODEC)
                .server_streaming()
                .build(),
        )
        .build();

    let certificate_authority = Service::builder()
        .name("CertificateAuthority")
        .package("gatehouse.ca")
        .method(unary(
            "certificate",
            "Certificate",
            "CertificateRequest",
            "CertificateResponse",
        ))
        .build();

    let api_keys = Service::builder()
        .name("ApiKeys")
        .package("gatehouse.apikey")
        .method(unary("generate_api_key", "GenerateApiKey", "KeyRequest", "ApiKey"))
        .method(unary("revoke_api_key", "RevokeApiKey", "ApiKey", "ChangeResult"))
        .build();

    Builder::new().compile(&[authorization, registry, certificate_authority, api_keys]);
}

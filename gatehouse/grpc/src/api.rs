//! Wire messages and generated service stubs.
#![allow(rust_2018_idioms)]

use std::collections::HashMap;

include!(concat!(env!("OUT_DIR"), "/gatehouse.authz.Authorization.rs"));
include!(concat!(env!("OUT_DIR"), "/gatehouse.registry.Registry.rs"));
include!(concat!(env!("OUT_DIR"), "/gatehouse.ca.CertificateAuthority.rs"));
include!(concat!(env!("OUT_DIR"), "/gatehouse.apikey.ApiKeys.rs"));

// === gatehouse.authz ===

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthorizeRequest {
    #[prost(string, tag = "1")]
    pub subject_id: String,
    #[prost(string, repeated, tag = "2")]
    pub permissions: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthorizeResponse {
    #[prost(oneof = "authorize_response::Outcome", tags = "1, 2")]
    pub outcome: Option<authorize_response::Outcome>,
}

pub mod authorize_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "1")]
        Success(super::AuthorizeSuccess),
        #[prost(message, tag = "2")]
        Error(super::AuthorizeError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthorizeSuccess {
    /// One entry per requested permission.
    #[prost(map = "string, bool", tag = "1")]
    pub permissions: HashMap<String, bool>,
    /// Unix seconds until which the answer may be reused.
    #[prost(int64, tag = "2")]
    pub cache_ttl: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthorizeError {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateSubjectRequest {
    #[prost(string, tag = "1")]
    pub subject_id: String,
    #[prost(string, repeated, tag = "2")]
    pub permissions: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub roles: Vec<String>,
}

/// Permissions or roles to add to, or remove from, a subject.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubjectItemsRequest {
    #[prost(string, tag = "1")]
    pub subject_id: String,
    #[prost(string, repeated, tag = "2")]
    pub items: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RolePermissionsRequest {
    #[prost(string, tag = "1")]
    pub role_id: String,
    #[prost(string, repeated, tag = "2")]
    pub permissions: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeResult {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListSubjectRequest {
    #[prost(string, tag = "1")]
    pub subject_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubjectAuthz {
    #[prost(string, tag = "1")]
    pub subject_id: String,
    #[prost(string, repeated, tag = "2")]
    pub permissions: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub roles: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListRoleRequest {
    #[prost(string, tag = "1")]
    pub role_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoleAuthz {
    #[prost(string, tag = "1")]
    pub role_id: String,
    #[prost(string, repeated, tag = "2")]
    pub permissions: Vec<String>,
}

// === gatehouse.registry ===

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Protocol {
    Http1 = 0,
    Http2 = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Registration {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, repeated, tag = "3")]
    pub hosts: Vec<String>,
    #[prost(uint32, tag = "4")]
    pub port: u32,
    #[prost(bool, tag = "5")]
    pub tls: bool,
    #[prost(enumeration = "Protocol", tag = "6")]
    pub protocol: i32,
    /// Empty for a public route.
    #[prost(string, tag = "7")]
    pub permission: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRoutingRequest {
    #[prost(message, optional, tag = "1")]
    pub registration: Option<Registration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeployedService {
    #[prost(string, tag = "1")]
    pub deployment_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopRoutingRequest {
    #[prost(string, tag = "1")]
    pub deployment_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopRoutingResponse {
    #[prost(bool, tag = "1")]
    pub removed: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistryUpdate {
    #[prost(oneof = "registry_update::Kind", tags = "1, 2, 3")]
    pub kind: Option<registry_update::Kind>,
}

pub mod registry_update {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Reset(super::Reset),
        #[prost(message, tag = "2")]
        Upsert(super::Registration),
        #[prost(message, tag = "3")]
        Remove(super::Removed),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reset {
    #[prost(message, repeated, tag = "1")]
    pub registrations: Vec<Registration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Removed {
    #[prost(string, tag = "1")]
    pub service_name: String,
}

// === gatehouse.ca ===

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CertificateRequest {
    #[prost(string, tag = "1")]
    pub subject_id: String,
    #[prost(string, tag = "2")]
    pub data_classification: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CertificateResponse {
    #[prost(oneof = "certificate_response::Outcome", tags = "1, 2")]
    pub outcome: Option<certificate_response::Outcome>,
}

pub mod certificate_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "1")]
        Issued(super::IssuedCertificate),
        #[prost(message, tag = "2")]
        Error(super::CertificateError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IssuedCertificate {
    #[prost(string, tag = "1")]
    pub cert_chain: String,
    #[prost(string, tag = "2")]
    pub private_key: String,
    /// Unix seconds.
    #[prost(int64, tag = "3")]
    pub expiration: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CertificateError {
    #[prost(string, tag = "1")]
    pub message: String,
}

// === gatehouse.apikey ===

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyRequest {
    #[prost(string, tag = "1")]
    pub team_name: String,
    #[prost(string, tag = "2")]
    pub service_name: String,
    /// A label for the key's holder; it does not affect what the key grants.
    #[prost(string, tag = "3")]
    pub key_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiKey {
    #[prost(string, tag = "1")]
    pub team_name: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(string, tag = "3")]
    pub service_name: String,
    #[prost(string, tag = "4")]
    pub key_name: String,
}

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod api;
pub mod apikey;
pub mod authz;
pub mod ca;
pub mod client;
pub mod metrics;
pub mod registry;

pub use self::{
    apikey::ApiKeyServer,
    authz::AuthzServer,
    ca::CaClient,
    client::{AuthzClient, ClientConfig},
    metrics::GrpcServerMetricsFamily,
    registry::{DeploymentRegistry, RegistryFeedClient},
};

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gatehouse_core as core;
pub use gatehouse_grpc as grpc;
pub use gatehouse_index as index;
pub use gatehouse_proxy as proxy;

mod admin;
mod args;
mod authz;
mod gateway;
mod log;
mod manage;
mod routes;
mod shutdown;
mod tls;

pub use self::args::Args;

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod apikey;
pub mod authz;
pub mod ca;
mod error;
pub mod registry;
pub mod routes;

pub use self::error::Error;

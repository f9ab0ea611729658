#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;
mod table;
mod watcher;

pub use self::{
    index::{Index, SharedIndex},
    table::{RouteTable, Snapshot, StaleSnapshot},
    watcher::{Backoff, RegistryFeed, RegistryStream, Watcher},
};

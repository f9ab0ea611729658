#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
pub mod forward;
pub mod identity;
mod metrics;
mod server;

pub use self::{
    admission::{Admission, Admitted, Exchange, Rejection, State},
    forward::{Body, ForwardError, Forwarder},
    identity::Identity,
    metrics::{AdmissionMetrics, Outcome},
    server::Gateway,
};

use thiserror::Error;

/// Failures surfaced by the gateway and the authorization service.
///
/// `AuthorizationDenied` and `AuthorizationUnavailable` are reported
/// separately so that outages can be told apart from policy in logs, but
/// admission treats both as a rejection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("no verified client identity")]
    AuthenticationAbsent,

    #[error("{subject} is not granted every required permission")]
    AuthorizationDenied { subject: String },

    #[error("authorization service unavailable: {0}")]
    AuthorizationUnavailable(String),

    #[error("no route matches {0}")]
    RouteNotFound(String),

    #[error("malformed registration event: {0}")]
    MalformedRegistrationEvent(String),

    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl Error {
    /// Whether the caller may retry the same operation later.
    ///
    /// Authentication and authorization outcomes are never retried within a
    /// request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackingStoreUnavailable(_) | Self::TransportFailure(_)
        )
    }
}

//! The admission decision for a single request.
//!
//! A connection moves from `Connecting` through the TLS handshake to either
//! `Authenticated` or `Unauthenticated`. Each request on it then resolves a
//! route, is authorized when the route requires it, and ends `Forwarded` or
//! `Rejected` before it is `Closed`.
//!
//! Routes are matched on the canonical form of the request path, and that
//! form is what the backend receives. Protected routes authorize the
//! client certificate's identity, except for `apikey` permissions, which
//! authorize the key the request carries in its `apikey` header.

use crate::{
    identity::Identity,
    metrics::{AdmissionMetrics, Outcome},
};
use gatehouse_core::{
    apikey,
    authz::Authorize,
    routes::{canonical_path, Route},
    Error,
};
use gatehouse_index::RouteTable;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, trace, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Connecting,
    TlsHandshake,
    Authenticated,
    Unauthenticated,
    RouteResolved,
    Authorizing,
    Forwarded,
    Rejected,
    Closed,
}

/// Why a request was not forwarded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("malformed request path {0:?}")]
    BadPath(String),

    #[error("no route for {0}")]
    NotFound(String),

    #[error("route requires a credential")]
    Unauthenticated,

    #[error("{subject} lacks {permission}")]
    Denied { subject: Identity, permission: String },

    #[error("authorization unavailable: {0}")]
    Unavailable(String),
}

/// One request's walk through the admission states.
pub struct Exchange {
    identity: Option<Identity>,
    api_key: Option<String>,
    state: State,
    visited: Vec<State>,
}

/// A request that may be forwarded.
#[derive(Clone, Debug)]
pub struct Admitted {
    pub route: Arc<Route>,
    /// The canonical request path.
    pub path: String,
}

/// Decides whether requests may reach their route's backend.
#[derive(Debug)]
pub struct Admission<A> {
    table: Arc<RouteTable>,
    authz: A,
    timeout: Duration,
    metrics: AdmissionMetrics,
}

// === impl State ===

impl State {
    /// The state a connection settles in once its handshake completes.
    pub fn established(identity: Option<&Identity>) -> Self {
        if identity.is_some() {
            Self::Authenticated
        } else {
            Self::Unauthenticated
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Connecting, TlsHandshake)
                | (Connecting, Unauthenticated)
                | (Connecting, Closed)
                | (TlsHandshake, Authenticated)
                | (TlsHandshake, Unauthenticated)
                | (TlsHandshake, Closed)
                | (Authenticated, RouteResolved)
                | (Unauthenticated, RouteResolved)
                | (Authenticated, Rejected)
                | (Unauthenticated, Rejected)
                | (Authenticated, Closed)
                | (Unauthenticated, Closed)
                | (RouteResolved, Authorizing)
                | (RouteResolved, Forwarded)
                | (RouteResolved, Rejected)
                | (Authorizing, Forwarded)
                | (Authorizing, Rejected)
                | (Forwarded, Closed)
                | (Rejected, Closed)
        )
    }

    /// Moves to `next`, which must follow `self`.
    pub fn advance(&mut self, next: Self) {
        debug_assert!(self.can_advance_to(next), "{self:?} -> {next:?}");
        trace!(from = ?self, to = ?next, "Admission state");
        *self = next;
    }
}

// === impl Rejection ===

impl Rejection {
    pub fn status(&self) -> http::StatusCode {
        match self {
            Self::BadPath(_) => http::StatusCode::BAD_REQUEST,
            Self::NotFound(_) => http::StatusCode::NOT_FOUND,
            Self::Unauthenticated => http::StatusCode::UNAUTHORIZED,
            // A denial and an outage look the same to the client.
            Self::Denied { .. } | Self::Unavailable(_) => http::StatusCode::FORBIDDEN,
        }
    }

    fn outcome(&self) -> Outcome {
        match self {
            Self::BadPath(_) => Outcome::BadRequest,
            Self::NotFound(_) => Outcome::NotFound,
            Self::Unauthenticated => Outcome::Unauthenticated,
            Self::Denied { .. } => Outcome::Denied,
            Self::Unavailable(_) => Outcome::Unavailable,
        }
    }
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::BadPath(path) | Rejection::NotFound(path) => Error::RouteNotFound(path),
            Rejection::Unauthenticated => Error::AuthenticationAbsent,
            Rejection::Denied { subject, .. } => Error::AuthorizationDenied {
                subject: subject.to_string(),
            },
            Rejection::Unavailable(reason) => Error::AuthorizationUnavailable(reason),
        }
    }
}

// === impl Exchange ===

impl Exchange {
    /// Starts a request on a connection whose handshake yielded `identity`.
    pub fn new(identity: Option<Identity>) -> Self {
        let state = State::established(identity.as_ref());
        Self {
            identity,
            api_key: None,
            state,
            visited: vec![state],
        }
    }

    /// Attaches the API key the request presented, if any.
    pub fn with_api_key(self, api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            ..self
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state this request has been in, in order.
    pub fn visited(&self) -> &[State] {
        &self.visited
    }

    pub fn close(&mut self) {
        if self.state != State::Closed {
            self.advance(State::Closed);
        }
    }

    fn advance(&mut self, next: State) {
        self.state.advance(next);
        self.visited.push(next);
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("identity", &self.identity)
            .field("api_key", &self.api_key.as_deref().map(apikey::redact))
            .field("state", &self.state)
            .finish()
    }
}

// === impl Admission ===

impl<A: Authorize> Admission<A> {
    /// `timeout` bounds each authorization call; a call that takes longer
    /// is a rejection.
    pub fn new(
        table: Arc<RouteTable>,
        authz: A,
        timeout: Duration,
        metrics: AdmissionMetrics,
    ) -> Self {
        Self {
            table,
            authz,
            timeout,
            metrics,
        }
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    /// Resolves and authorizes a request for `path`, returning the route it
    /// may be forwarded to and the path to forward.
    pub async fn admit(&self, exchange: &mut Exchange, path: &str) -> Result<Admitted, Rejection> {
        let res = self.decide(exchange, path).await;
        match &res {
            Ok(_) => {
                exchange.advance(State::Forwarded);
                self.metrics.record(Outcome::Forwarded);
            }
            Err(rejection) => {
                exchange.advance(State::Rejected);
                self.metrics.record(rejection.outcome());
            }
        }
        res
    }

    async fn decide(&self, exchange: &mut Exchange, raw: &str) -> Result<Admitted, Rejection> {
        let path = canonical_path(raw).map_err(|error| {
            debug!(path = %raw, %error, "Malformed request path");
            Rejection::BadPath(raw.to_string())
        })?;
        let route = self.table.lookup(&path).ok_or_else(|| {
            debug!(%path, "No route");
            Rejection::NotFound(path.clone())
        })?;
        exchange.advance(State::RouteResolved);

        let Some(permission) = route.permission.clone() else {
            return Ok(Admitted { route, path });
        };

        // `label` names the caller in logs and rejections; a key is never
        // logged in full.
        let (subject, label, permission) = if apikey::is_key_permission(&permission) {
            let Some(key) = exchange.api_key.clone() else {
                debug!(%path, %permission, "Request for a key-protected route carries no API key");
                return Err(Rejection::Unauthenticated);
            };
            let label = Identity::from(apikey::redact(&key));
            let permission = if permission == apikey::ENCODED_PATH {
                match apikey::path_permission(&path) {
                    Some(permission) => permission,
                    None => {
                        info!(subject = %label, %path, "Path names no team and service");
                        return Err(Rejection::Denied {
                            subject: label,
                            permission,
                        });
                    }
                }
            } else {
                permission
            };
            (Identity::from(key), label, permission)
        } else {
            let Some(subject) = exchange.identity().cloned() else {
                debug!(%path, %permission, "Unauthenticated request for a protected route");
                return Err(Rejection::Unauthenticated);
            };
            (subject.clone(), subject, permission)
        };

        exchange.advance(State::Authorizing);
        let permissions = [permission];
        let res = time::timeout(self.timeout, self.authz.authorize(&subject, &permissions)).await;
        let [permission] = permissions;
        match res {
            Ok(Ok(authz)) if authz.is_allowed() => Ok(Admitted { route, path }),
            Ok(Ok(_)) => {
                info!(subject = %label, %permission, %path, "Denied");
                Err(Rejection::Denied {
                    subject: label,
                    permission,
                })
            }
            Ok(Err(error)) => {
                warn!(subject = %label, %permission, %error, "Authorization failed");
                Err(Rejection::Unavailable(error.to_string()))
            }
            Err(_) => {
                let error = Error::AuthorizationUnavailable(format!(
                    "no answer within {:?}",
                    self.timeout
                ));
                warn!(subject = %label, %permission, %error, "Authorization timed out");
                Err(Rejection::Unavailable(error.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::{
        authz::Authorization,
        routes::{Protocol, Source},
    };
    use std::{
        future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    #[derive(Copy, Clone, Debug)]
    enum Answer {
        Grant,
        Refuse,
        Fail,
        Hang,
    }

    /// Answers every call the same way and records what was asked.
    #[derive(Debug)]
    struct Fixed {
        answer: Answer,
        calls: AtomicUsize,
        asked: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait::async_trait]
    impl Authorize for Fixed {
        async fn authorize(
            &self,
            subject: &str,
            permissions: &[String],
        ) -> Result<Authorization, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.asked
                .lock()
                .unwrap()
                .push((subject.to_string(), permissions.to_vec()));
            match self.answer {
                Answer::Grant => Ok(Authorization::from_requested(permissions, |_| true)),
                Answer::Refuse => Ok(Authorization::from_requested(permissions, |_| false)),
                Answer::Fail => Err(Error::AuthorizationUnavailable("refused".to_string())),
                Answer::Hang => future::pending().await,
            }
        }
    }

    fn route(pattern: &str, permission: Option<&str>) -> Arc<Route> {
        Arc::new(Route {
            pattern: pattern.parse().unwrap(),
            targets: vec!["127.0.0.1:8080".parse().unwrap()],
            permission: permission.map(ToString::to_string),
            tls: false,
            protocol: Protocol::Http1,
            source: Source::Static,
        })
    }

    fn admission(answer: Answer) -> Admission<Fixed> {
        admission_with(
            answer,
            vec![
                route("/public/*", None),
                route("/svc/a/*", Some("svc-a-access")),
            ],
        )
    }

    fn admission_with(answer: Answer, routes: Vec<Arc<Route>>) -> Admission<Fixed> {
        let table = Arc::new(RouteTable::new());
        table.publish(routes);
        let metrics = AdmissionMetrics::register(&mut Default::default());
        Admission::new(
            table,
            Fixed {
                answer,
                calls: AtomicUsize::new(0),
                asked: Mutex::new(Vec::new()),
            },
            Duration::from_secs(1),
            metrics,
        )
    }

    /// A catch-all public route beside a protected one.
    fn public_fallback(answer: Answer) -> Admission<Fixed> {
        admission_with(
            answer,
            vec![route("/*", None), route("/svc/a/*", Some("svc-a-access"))],
        )
    }

    const DISGUISED: [&str; 4] = ["/svc//a/x", "/svc/./a/x", "/x/../svc/a/x", "/svc/%61/x"];

    fn alice() -> Option<Identity> {
        Some("alice".into())
    }

    #[tokio::test]
    async fn public_routes_need_no_identity_and_no_rpc() {
        let admission = admission(Answer::Fail);
        let mut exchange = Exchange::new(None);

        let route = admission.admit(&mut exchange, "/public/x").await.unwrap().route;
        assert!(route.is_public());
        assert_eq!(
            exchange.visited(),
            [State::Unauthenticated, State::RouteResolved, State::Forwarded]
        );
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 0);
        assert_eq!(admission.metrics().count(Outcome::Forwarded), 1);
    }

    #[tokio::test]
    async fn protected_routes_reject_unauthenticated_requests_without_rpc() {
        let admission = admission(Answer::Grant);
        let mut exchange = Exchange::new(None);

        let rejection = admission.admit(&mut exchange, "/svc/a/x").await.unwrap_err();
        assert_eq!(rejection, Rejection::Unauthenticated);
        assert_eq!(rejection.status(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(exchange.state(), State::Rejected);
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn misses_are_rejected_before_authorization() {
        let admission = admission(Answer::Grant);
        let mut exchange = Exchange::new(alice());

        let rejection = admission.admit(&mut exchange, "/svc/z").await.unwrap_err();
        assert_eq!(rejection, Rejection::NotFound("/svc/z".to_string()));
        assert_eq!(rejection.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(exchange.visited(), [State::Authenticated, State::Rejected]);
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn granted_requests_are_forwarded() {
        let admission = admission(Answer::Grant);
        let mut exchange = Exchange::new(alice());

        let route = admission.admit(&mut exchange, "/svc/a/orders").await.unwrap().route;
        assert_eq!(route.permission.as_deref(), Some("svc-a-access"));
        exchange.close();
        assert_eq!(
            exchange.visited(),
            [
                State::Authenticated,
                State::RouteResolved,
                State::Authorizing,
                State::Forwarded,
                State::Closed,
            ]
        );
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denials_and_failures_are_indistinguishable_to_clients() {
        let denied = admission(Answer::Refuse)
            .admit(&mut Exchange::new(alice()), "/svc/a/x")
            .await
            .unwrap_err();
        assert!(matches!(denied, Rejection::Denied { .. }));

        let failed = admission(Answer::Fail)
            .admit(&mut Exchange::new(alice()), "/svc/a/x")
            .await
            .unwrap_err();
        assert!(matches!(failed, Rejection::Unavailable(_)));

        assert_eq!(denied.status(), http::StatusCode::FORBIDDEN);
        assert_eq!(denied.status(), failed.status());

        // Logs still tell them apart.
        assert_eq!(
            Error::from(denied),
            Error::AuthorizationDenied {
                subject: "alice".to_string()
            }
        );
        assert!(matches!(
            Error::from(failed),
            Error::AuthorizationUnavailable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_authorization_is_rejected() {
        let admission = admission(Answer::Hang);
        let mut exchange = Exchange::new(alice());

        {
            let mut admit = tokio_test::task::spawn(admission.admit(&mut exchange, "/svc/a/x"));
            tokio_test::assert_pending!(admit.poll());
            time::advance(Duration::from_millis(999)).await;
            tokio_test::assert_pending!(admit.poll());
            time::advance(Duration::from_millis(1)).await;
            let rejection = tokio_test::assert_ready_err!(admit.poll());
            assert!(matches!(rejection, Rejection::Unavailable(_)));
        }
        assert_eq!(exchange.state(), State::Rejected);
        assert_eq!(admission.metrics().count(Outcome::Unavailable), 1);
    }

    #[tokio::test]
    async fn disguised_paths_cannot_reach_protected_routes_anonymously() {
        let admission = public_fallback(Answer::Grant);
        for path in DISGUISED {
            let mut exchange = Exchange::new(None);
            let rejection = admission.admit(&mut exchange, path).await.unwrap_err();
            assert_eq!(rejection, Rejection::Unauthenticated, "{path}");
            assert_eq!(
                exchange.visited(),
                [State::Unauthenticated, State::RouteResolved, State::Rejected],
                "{path}"
            );
        }
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 0);
        assert_eq!(admission.metrics().count(Outcome::Forwarded), 0);
    }

    #[tokio::test]
    async fn disguised_paths_are_authorized_and_forwarded_canonically() {
        let admission = public_fallback(Answer::Grant);
        for path in DISGUISED {
            let admitted = admission
                .admit(&mut Exchange::new(alice()), path)
                .await
                .unwrap();
            assert_eq!(admitted.route.permission.as_deref(), Some("svc-a-access"), "{path}");
            assert_eq!(admitted.path, "/svc/a/x", "{path}");
        }
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), DISGUISED.len());

        let denied = public_fallback(Answer::Refuse);
        for path in DISGUISED {
            let rejection = denied
                .admit(&mut Exchange::new(alice()), path)
                .await
                .unwrap_err();
            assert!(matches!(rejection, Rejection::Denied { .. }), "{path}");
        }
    }

    #[tokio::test]
    async fn malformed_paths_are_bad_requests() {
        let admission = public_fallback(Answer::Grant);
        for path in ["/svc%2Fa/x", "/svc\\a/x", "/svc/%zz"] {
            let mut exchange = Exchange::new(alice());
            let rejection = admission.admit(&mut exchange, path).await.unwrap_err();
            assert_eq!(rejection, Rejection::BadPath(path.to_string()));
            assert_eq!(rejection.status(), http::StatusCode::BAD_REQUEST);
            assert_eq!(exchange.visited(), [State::Authenticated, State::Rejected]);
        }
        assert_eq!(admission.metrics().count(Outcome::BadRequest), 3);
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 0);
    }

    fn keyed(answer: Answer) -> Admission<Fixed> {
        admission_with(
            answer,
            vec![
                route("/v1/*", Some(apikey::ENCODED_PATH)),
                route("/reports/*", Some("apikey:reports:export:*")),
                route("/svc/a/*", Some("svc-a-access")),
            ],
        )
    }

    #[tokio::test]
    async fn api_keys_are_authorized_as_subjects() {
        let admission = keyed(Answer::Grant);
        let key = "0b3a7c0e-5f0c-4cf4-a1f4-3b3c3f1d7d01";

        let admitted = admission
            .admit(
                &mut Exchange::new(None).with_api_key(Some(key.to_string())),
                "/v1/Orders/checkout/cart",
            )
            .await
            .unwrap();
        assert_eq!(admitted.path, "/v1/Orders/checkout/cart");

        admission
            .admit(
                &mut Exchange::new(alice()).with_api_key(Some(key.to_string())),
                "/reports/daily",
            )
            .await
            .unwrap();

        assert_eq!(
            *admission.authz.asked.lock().unwrap(),
            [
                (key.to_string(), vec!["apikey:orders:checkout:*".to_string()]),
                (key.to_string(), vec!["apikey:reports:export:*".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn api_key_routes_need_a_key() {
        let admission = keyed(Answer::Grant);

        for mut exchange in [
            Exchange::new(alice()),
            Exchange::new(None).with_api_key(Some(String::new())),
        ] {
            let rejection = admission
                .admit(&mut exchange, "/v1/orders/checkout/cart")
                .await
                .unwrap_err();
            assert_eq!(rejection, Rejection::Unauthenticated);
        }

        // A key does not stand in for a client certificate.
        let rejection = admission
            .admit(
                &mut Exchange::new(None).with_api_key(Some("k".to_string())),
                "/svc/a/x",
            )
            .await
            .unwrap_err();
        assert_eq!(rejection, Rejection::Unauthenticated);
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn encoded_paths_must_name_a_team_and_service() {
        let admission = keyed(Answer::Grant);
        let key = "0b3a7c0e-5f0c-4cf4-a1f4-3b3c3f1d7d01";

        let rejection = admission
            .admit(
                &mut Exchange::new(None).with_api_key(Some(key.to_string())),
                "/v1/orders",
            )
            .await
            .unwrap_err();
        match rejection {
            Rejection::Denied {
                subject,
                permission,
            } => {
                assert_eq!(permission, apikey::ENCODED_PATH);
                assert!(!subject.contains(key));
            }
            rejection => panic!("unexpected {rejection:?}"),
        }
        assert_eq!(admission.authz.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exchanges_do_not_print_keys() {
        let key = "0b3a7c0e-5f0c-4cf4-a1f4-3b3c3f1d7d01";
        let exchange = Exchange::new(None).with_api_key(Some(key.to_string()));
        assert!(!format!("{exchange:?}").contains(key));
    }

    #[test]
    fn transitions() {
        use State::*;
        assert!(Connecting.can_advance_to(TlsHandshake));
        assert!(TlsHandshake.can_advance_to(Authenticated));
        assert!(Authorizing.can_advance_to(Rejected));
        assert!(Forwarded.can_advance_to(Closed));

        assert!(!Unauthenticated.can_advance_to(Authorizing));
        assert!(!Authenticated.can_advance_to(Forwarded));
        assert!(!Rejected.can_advance_to(Forwarded));
        assert!(!Closed.can_advance_to(Connecting));
    }
}

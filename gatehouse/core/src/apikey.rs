//! API keys: an alternative credential for routes that cannot rely on
//! client certificates.
//!
//! A key is itself a subject in the authorization graph. Generating a key
//! grants it `apikey:<team>:<service>:*`; a route whose permission is
//! `apikey:encoded_path` requires exactly that grant for the team and
//! service named by the request path (`/<version>/<team>/<service>/...`).

use thiserror::Error;
use uuid::Uuid;

/// The request header that carries a key.
pub const HEADER: &str = "apikey";

/// The route permission that derives the required grant from the path.
pub const ENCODED_PATH: &str = "apikey:encoded_path";

const PREFIX: &str = "apikey";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid API key {field} {value:?}")]
pub struct InvalidKeyName {
    pub field: &'static str,
    pub value: String,
}

/// Whether a route permission is checked against an API key rather than a
/// client certificate.
pub fn is_key_permission(permission: &str) -> bool {
    permission == PREFIX
        || permission
            .strip_prefix(PREFIX)
            .is_some_and(|rest| rest.starts_with(':'))
}

/// The grant held by every key issued to `team` for `service`.
pub fn grant(team: &str, service: &str) -> Result<String, InvalidKeyName> {
    Ok(format!(
        "{PREFIX}:{}:{}:*",
        check("team", team)?,
        check("service", service)?
    )
    .to_lowercase())
}

/// The grant a request for `path` must hold on an `apikey:encoded_path`
/// route, or `None` when the path does not name a team and a service.
pub fn path_permission(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let _version = segments.next()?;
    let team = segments.next()?;
    let service = segments.next()?;
    grant(team, service).ok()
}

pub fn generate() -> String {
    Uuid::new_v4().to_string()
}

/// A form of `key` that is safe to log.
pub fn redact(key: &str) -> String {
    let prefix = key.chars().take(8).collect::<String>();
    format!("apikey {prefix}...")
}

fn check<'a>(field: &'static str, value: &'a str) -> Result<&'a str, InvalidKeyName> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(value)
    } else {
        Err(InvalidKeyName {
            field,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_permissions() {
        assert!(is_key_permission("apikey"));
        assert!(is_key_permission(ENCODED_PATH));
        assert!(is_key_permission("apikey:orders:checkout:*"));
        assert!(!is_key_permission("apikeys"));
        assert!(!is_key_permission("svc-a-access"));
    }

    #[test]
    fn paths_name_the_required_grant() {
        assert_eq!(
            path_permission("/v1/Orders/checkout/cart/7").as_deref(),
            Some("apikey:orders:checkout:*")
        );
        assert_eq!(path_permission("/v1/orders/checkout"), grant("orders", "checkout").ok());
        assert_eq!(path_permission("/v1/orders"), None);
        assert_eq!(path_permission("/v1/or:ders/checkout"), None);
    }

    #[test]
    fn names_are_restricted() {
        assert!(grant("orders", "").is_err());
        assert!(grant("orders", "a:b").is_err());
        assert!(grant("orders/x", "checkout").is_err());
        assert_eq!(grant("Orders", "Check_Out").unwrap(), "apikey:orders:check_out:*");
    }

    #[test]
    fn keys_are_redacted() {
        let key = generate();
        let redacted = redact(&key);
        assert!(redacted.starts_with("apikey "));
        assert!(!redacted.contains(&key));
    }
}

use std::{cmp::Ordering, fmt, str::FromStr};
use thiserror::Error;

/// The permission value that marks a route as public in configuration.
pub const PUBLIC: &str = "none";

/// A request path pattern.
///
/// `/svc/a/*` is a prefix pattern matching `/svc/a` and everything below it;
/// any other path matches exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RoutePattern {
    Exact(String),
    /// The prefix, without the trailing `/*`.
    Prefix(String),
}

/// A backend endpoint, as `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

/// How the gateway speaks to a route's backends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Http1,
    Http2,
}

/// Where a route came from. Static configuration sorts before any
/// registration, so it wins ties on an identical pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Static,
    Registry { namespace: String, service: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub pattern: RoutePattern,
    pub targets: Vec<Target>,
    /// `None` for a public route.
    pub permission: Option<String>,
    pub tls: bool,
    pub protocol: Protocol,
    pub source: Source,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidRoute {
    #[error("route path must be absolute: {0:?}")]
    Path(String),

    #[error("wildcards are only supported as a trailing `/*`: {0:?}")]
    Wildcard(String),

    #[error("invalid backend target {0:?}; expected host:port")]
    Target(String),

    #[error("route {0} has no backend targets")]
    NoTargets(String),

    #[error("request path cannot be routed: {0:?}")]
    RequestPath(String),
}

/// Interprets a configured permission: empty or `none` means public.
pub fn required_permission(raw: Option<&str>) -> Option<String> {
    match raw.map(str::trim) {
        None | Some("") | Some(PUBLIC) => None,
        Some(p) => Some(p.to_string()),
    }
}

/// Rewrites a request path into the single form routes are matched against
/// and backends receive.
///
/// Percent-encoded unreserved characters are decoded, empty segments are
/// collapsed and dot-segments are removed. Encoded separators (`%2F`, `%5C`),
/// raw backslashes and malformed escapes are refused, since backends may
/// read them as structure the gateway did not see.
pub fn canonical_path(raw: &str) -> Result<String, InvalidRoute> {
    let invalid = || InvalidRoute::RequestPath(raw.to_string());
    if !raw.starts_with('/') {
        return Err(invalid());
    }

    let bytes = raw.as_bytes();
    let mut decoded = String::with_capacity(raw.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = raw
                    .get(i + 1..i + 3)
                    .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
                    .ok_or_else(invalid)?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| invalid())?;
                match byte {
                    b'/' | b'\\' => return Err(invalid()),
                    b if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') => {
                        decoded.push(char::from(b))
                    }
                    b => {
                        decoded.push('%');
                        decoded.push_str(&format!("{b:02X}"));
                    }
                }
                i += 3;
            }
            b'\\' => return Err(invalid()),
            _ => {
                // Copy the run up to the next escape unchanged; it may hold
                // multi-byte characters.
                let end = raw[i..].find(['%', '\\']).map_or(raw.len(), |n| i + n);
                decoded.push_str(&raw[i..end]);
                i = end;
            }
        }
    }

    let mut segments = Vec::new();
    let mut trailing = false;
    for segment in decoded.split('/').skip(1) {
        trailing = matches!(segment, "" | "." | "..");
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut path = String::with_capacity(decoded.len());
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if trailing || segments.is_empty() {
        path.push('/');
    }
    Ok(path)
}

// === impl RoutePattern ===

impl RoutePattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => p == path,
            Self::Prefix(p) => match path.strip_prefix(p.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }

    /// Orders patterns from most to least specific: exact patterns first,
    /// then longer prefixes before shorter ones.
    pub fn cmp_specificity(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => b.len().cmp(&a.len()),
            (Self::Exact(_), Self::Prefix(_)) => Ordering::Less,
            (Self::Prefix(_), Self::Exact(_)) => Ordering::Greater,
            (Self::Prefix(a), Self::Prefix(b)) => b.len().cmp(&a.len()),
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::Exact(p) | Self::Prefix(p) => p,
        }
    }
}

impl FromStr for RoutePattern {
    type Err = InvalidRoute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.starts_with('/') {
            return Err(InvalidRoute::Path(s.to_string()));
        }

        let pattern = match s.strip_suffix("/*") {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(s.to_string()),
        };
        if pattern.path().contains('*') {
            return Err(InvalidRoute::Wildcard(s.to_string()));
        }
        Ok(pattern)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => f.write_str(p),
            Self::Prefix(p) => write!(f, "{p}/*"),
        }
    }
}

// === impl Target ===

impl Target {
    /// The name presented for TLS verification; IPv6 brackets are removed.
    pub fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl FromStr for Target {
    type Err = InvalidRoute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| InvalidRoute::Target(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| InvalidRoute::Target(s.to_string()))?;
        if host.is_empty() {
            return Err(InvalidRoute::Target(s.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// === impl Protocol ===

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http1" | "http/1.1" => Ok(Self::Http1),
            "http2" | "h2" | "grpc" => Ok(Self::Http2),
            s => Err(format!("unsupported protocol {s:?}")),
        }
    }
}

// === impl Route ===

impl Route {
    pub fn is_public(&self) -> bool {
        self.permission.is_none()
    }

    /// Total order used for lookup: the first matching route in this order
    /// wins.
    pub fn cmp_precedence(&self, other: &Self) -> Ordering {
        self.pattern
            .cmp_specificity(&other.pattern)
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.pattern.path().cmp(other.pattern.path()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_patterns() {
        let p = "/svc/a/*".parse::<RoutePattern>().unwrap();
        assert_eq!(p, RoutePattern::Prefix("/svc/a".to_string()));
        assert!(p.matches("/svc/a"));
        assert!(p.matches("/svc/a/"));
        assert!(p.matches("/svc/a/orders/1"));
        assert!(!p.matches("/svc/ab"));
        assert!(!p.matches("/svc"));
        assert_eq!(p.to_string(), "/svc/a/*");

        let all = "/*".parse::<RoutePattern>().unwrap();
        assert!(all.matches("/anything"));
        assert!(all.matches("/"));
    }

    #[test]
    fn exact_patterns() {
        let p = "/health".parse::<RoutePattern>().unwrap();
        assert!(p.matches("/health"));
        assert!(!p.matches("/health/deep"));
    }

    #[test]
    fn invalid_patterns() {
        assert!(matches!(
            "svc/a".parse::<RoutePattern>(),
            Err(InvalidRoute::Path(_))
        ));
        assert!(matches!(
            "/svc/*/a".parse::<RoutePattern>(),
            Err(InvalidRoute::Wildcard(_))
        ));
    }

    #[test]
    fn specificity() {
        let exact = "/svc/a/x".parse::<RoutePattern>().unwrap();
        let long = "/svc/a/*".parse::<RoutePattern>().unwrap();
        let short = "/svc/*".parse::<RoutePattern>().unwrap();
        assert_eq!(exact.cmp_specificity(&long), Ordering::Less);
        assert_eq!(long.cmp_specificity(&short), Ordering::Less);
        assert_eq!(short.cmp_specificity(&exact), Ordering::Greater);
    }

    #[test]
    fn targets() {
        let t = "10.0.0.1:8080".parse::<Target>().unwrap();
        assert_eq!(t.host, "10.0.0.1");
        assert_eq!(t.port, 8080);

        let v6 = "[::1]:443".parse::<Target>().unwrap();
        assert_eq!(v6.server_name(), "::1");
        assert_eq!(v6.to_string(), "[::1]:443");

        assert!("no-port".parse::<Target>().is_err());
        assert!("host:0".parse::<Target>().is_err());
        assert!(":80".parse::<Target>().is_err());
    }

    #[test]
    fn canonical_paths() {
        for (raw, canonical) in [
            ("/svc/a/x", "/svc/a/x"),
            ("/svc//a/x", "/svc/a/x"),
            ("/svc/./a/x", "/svc/a/x"),
            ("/x/../svc/a/x", "/svc/a/x"),
            ("/../../svc/a/x", "/svc/a/x"),
            ("/svc/%61/x", "/svc/a/x"),
            ("/svc/a/%2e%2e/b", "/svc/b"),
            ("/svc/a/%7Euser", "/svc/a/~user"),
            ("/svc/a/caf%c3%a9", "/svc/a/caf%C3%A9"),
            ("/svc/a/café", "/svc/a/café"),
            ("/svc/a/", "/svc/a/"),
            ("/svc/a/b/..", "/svc/a/"),
            ("/svc/a/.", "/svc/a/"),
            ("/", "/"),
            ("//", "/"),
            ("/..", "/"),
        ] {
            assert_eq!(canonical_path(raw).unwrap(), canonical, "{raw}");
        }

        for raw in [
            "svc/a",
            "",
            "/svc%2Fa/x",
            "/svc%2fa/x",
            "/svc%5Ca/x",
            "/svc\\a/x",
            "/svc/%zz",
            "/svc/%6",
            "/svc/%+1",
        ] {
            assert!(
                matches!(canonical_path(raw), Err(InvalidRoute::RequestPath(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn public_permissions() {
        assert_eq!(required_permission(None), None);
        assert_eq!(required_permission(Some("none")), None);
        assert_eq!(required_permission(Some(" ")), None);
        assert_eq!(
            required_permission(Some("svc-a-access")),
            Some("svc-a-access".to_string())
        );
    }
}

use anyhow::{Context, Result};
use gatehouse_core::routes::{required_permission, Protocol, Route, RoutePattern, Source, Target};
use serde::Deserialize;
use std::path::Path;

/// A route as written in the static configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StaticRoute {
    path: String,
    #[serde(default)]
    permission: Option<String>,
    target: String,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    protocol: Option<String>,
}

/// Reads and validates the static routes in `path`.
pub(crate) async fn load(path: &Path) -> Result<Vec<Route>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading routes from {}", path.display()))?;
    parse(&json).with_context(|| format!("invalid routes in {}", path.display()))
}

pub(crate) fn parse(json: &str) -> Result<Vec<Route>> {
    let routes = serde_json::from_str::<Vec<StaticRoute>>(json)?;
    routes.into_iter().map(StaticRoute::into_route).collect()
}

impl StaticRoute {
    fn into_route(self) -> Result<Route> {
        let pattern = self
            .path
            .parse::<RoutePattern>()
            .with_context(|| format!("route {}", self.path))?;
        let target = self
            .target
            .parse::<Target>()
            .with_context(|| format!("route {}", self.path))?;
        let protocol = match self.protocol.as_deref() {
            Some(p) => p
                .parse::<Protocol>()
                .map_err(|e| anyhow::anyhow!("route {}: {e}", self.path))?,
            None => Protocol::default(),
        };
        Ok(Route {
            pattern,
            targets: vec![target],
            permission: required_permission(self.permission.as_deref()),
            tls: self.tls,
            protocol,
            source: Source::Static,
        })
    }
}

//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Compile routes and their gateway settings
//! - Look up matching route for request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan (acceptable for typical route counts)
//! - Higher priority first; longer path prefix breaks ties

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use thiserror::Error;

use crate::config::{KeepaliveConfig, RouteConfig};
use crate::gateway::{GatewaySettings, SettingsError};
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};

#[derive(Debug, Error)]
#[error("route {route:?}: {source}")]
pub struct RouterError {
    pub route: String,
    #[source]
    pub source: SettingsError,
}

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub priority: u32,
    prefix_len: usize,
    matcher: AndMatcher,
    pub settings: Arc<GatewaySettings>,
}

#[derive(Debug)]
pub enum RouteMatch<'a> {
    Matched(&'a Route),
    NoMatch,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(configs: &[RouteConfig], keepalive: &KeepaliveConfig) -> Result<Self, RouterError> {
        let mut routes = Vec::with_capacity(configs.len());

        for config in configs {
            let settings = GatewaySettings::compile(config, keepalive).map_err(|source| RouterError {
                route: config.name.clone(),
                source,
            })?;

            let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
            if let Some(host) = &config.host {
                matchers.push(Box::new(HostMatcher::new(host)));
            }
            let prefix = PathPrefixMatcher::new(settings.location.clone());
            let prefix_len = prefix.len();
            matchers.push(Box::new(prefix));

            routes.push(Route {
                name: config.name.clone(),
                priority: config.priority,
                prefix_len,
                matcher: AndMatcher::new(matchers),
                settings: Arc::new(settings),
            });
        }

        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.prefix_len.cmp(&a.prefix_len)));
        tracing::debug!(routes = routes.len(), "Router compiled");
        Ok(Self { routes })
    }

    pub fn match_route(&self, req: &Request<Body>) -> RouteMatch<'_> {
        match self.routes.iter().find(|r| r.matcher.matches(req)) {
            Some(route) => RouteMatch::Matched(route),
            None => RouteMatch::NoMatch,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, host: Option<&str>, prefix: Option<&str>, priority: u32) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            host: host.map(Into::into),
            path_prefix: prefix.map(Into::into),
            priority,
            proxy_pass: "http://web".into(),
            ..Default::default()
        }
    }

    fn req(host: &str, path: &str) -> Request<Body> {
        Request::builder().uri(path).header("Host", host).body(Body::empty()).unwrap()
    }

    fn matched(router: &Router, host: &str, path: &str) -> Option<String> {
        match router.match_route(&req(host, path)) {
            RouteMatch::Matched(r) => Some(r.name.clone()),
            RouteMatch::NoMatch => None,
        }
    }

    #[test]
    fn test_longest_prefix_wins_at_equal_priority() {
        let router = Router::new(
            &[route("root", None, None, 0), route("api", None, Some("/api/"), 0)],
            &KeepaliveConfig::default(),
        )
        .unwrap();
        assert_eq!(matched(&router, "x", "/api/users").as_deref(), Some("api"));
        assert_eq!(matched(&router, "x", "/other").as_deref(), Some("root"));
    }

    #[test]
    fn test_priority_and_host() {
        let router = Router::new(
            &[
                route("api", None, Some("/api/"), 1),
                route("admin", Some("admin.example.com"), Some("/"), 10),
            ],
            &KeepaliveConfig::default(),
        )
        .unwrap();
        assert_eq!(matched(&router, "admin.example.com", "/api/x").as_deref(), Some("admin"));
        assert_eq!(matched(&router, "www.example.com", "/api/x").as_deref(), Some("api"));
        assert_eq!(matched(&router, "www.example.com", "/static"), None);
    }

    #[test]
    fn test_invalid_route_is_rejected() {
        let mut bad = route("bad", None, None, 0);
        bad.proxy_pass = "https://web".into();
        let err = Router::new(&[bad], &KeepaliveConfig::default()).unwrap_err();
        assert_eq!(err.route, "bad");
    }
}

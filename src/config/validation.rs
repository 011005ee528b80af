//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing backend groups)
//! - Compile every pattern, flag and condition once so bad ones surface
//!   before the gateway starts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{ProxyConfig, RewriteConfig, RouteConfig};
use crate::gateway::{ProxyPass, SettingsError};
use crate::gateway::settings::parse_http_version;
use crate::resilience::NextUpstream;
use crate::rewrite::{CookieFlagRule, RewriteRule};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid {field} address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("route {route:?}: proxy_pass is empty")]
    MissingProxyPass { route: String },

    #[error("route {route:?}: {source}")]
    Route {
        route: String,
        #[source]
        source: SettingsError,
    },

    #[error("route {route:?}: unknown backend group {group:?}")]
    UnknownGroup { route: String, group: String },

    #[error("route {route:?}: invalid header {name:?}")]
    InvalidHeader { route: String, name: String },

    #[error("route {route:?}: {field} must be greater than zero")]
    Zero { route: String, field: &'static str },

    #[error("duplicate backend name {0:?}")]
    DuplicateBackend(String),
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_address(&mut errors, "metrics", &config.observability.metrics_address);
    }

    let mut names = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        check_address(&mut errors, "backend", &backend.address);
    }

    let groups: HashSet<&str> = config.backends.iter().map(|b| b.group.as_str()).collect();
    for route in &config.routes {
        validate_route(&mut errors, route, &groups);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn validate_route(errors: &mut Vec<ValidationError>, route: &RouteConfig, groups: &HashSet<&str>) {
    let name = || route.name.clone();
    let mut fail = |source: SettingsError| errors.push(ValidationError::Route { route: name(), source });

    if let Err(e) = parse_http_version(&route.http_version) {
        fail(e);
    }
    for rules in [&route.redirects, &route.cookie_domains, &route.cookie_paths] {
        if let Err(e) = check_rules(rules) {
            fail(e);
        }
    }
    for flags in &route.cookie_flags {
        if let Err(e) = CookieFlagRule::parse(&flags.cookie, &flags.flags) {
            fail(e.into());
        }
    }
    if let Err(e) = NextUpstream::parse(&route.next_upstream, route.next_upstream_tries) {
        fail(e.into());
    }

    if route.proxy_pass.is_empty() {
        errors.push(ValidationError::MissingProxyPass { route: name() });
    } else {
        match ProxyPass::parse(&route.proxy_pass) {
            Ok(pass) if !groups.contains(pass.group.as_str()) => errors.push(ValidationError::UnknownGroup {
                route: name(),
                group: pass.group,
            }),
            Ok(_) => {}
            Err(source) => errors.push(ValidationError::Route { route: name(), source }),
        }
    }

    for header in &route.set_headers {
        if !is_token(&header.name) || header.value.contains(['\r', '\n']) {
            errors.push(ValidationError::InvalidHeader {
                route: name(),
                name: header.name.clone(),
            });
        }
    }

    if route.buffer_size == 0 {
        errors.push(ValidationError::Zero {
            route: name(),
            field: "buffer_size",
        });
    }
    if route.buffers == 0 {
        errors.push(ValidationError::Zero {
            route: name(),
            field: "buffers",
        });
    }
}

fn check_rules(rules: &[RewriteConfig]) -> Result<(), SettingsError> {
    for rule in rules {
        RewriteRule::parse(&rule.pattern, &rule.replacement)?;
    }
    Ok(())
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, CookieFlagsConfig, SetHeaderConfig};

    fn config_with(route: RouteConfig) -> ProxyConfig {
        ProxyConfig {
            routes: vec![route],
            backends: vec![BackendConfig::new("b1", "web", "127.0.0.1:3000")],
            ..Default::default()
        }
    }

    fn route(proxy_pass: &str) -> RouteConfig {
        RouteConfig {
            name: "r".into(),
            proxy_pass: proxy_pass.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&config_with(route("http://web/api/"))).is_ok());
    }

    #[test]
    fn test_unknown_group() {
        let errors = validate_config(&config_with(route("http://other"))).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ValidationError::UnknownGroup { group, .. } if group == "other"));
    }

    #[test]
    fn test_https_is_rejected() {
        let errors = validate_config(&config_with(route("https://web"))).unwrap_err();
        assert!(matches!(
            &errors[0],
            ValidationError::Route {
                source: SettingsError::UnsupportedScheme(_),
                ..
            }
        ));
    }

    #[test]
    fn test_all_route_errors_are_collected() {
        let mut r = route("");
        r.http_version = "2".into();
        r.cookie_paths = vec![RewriteConfig {
            pattern: "~*[".into(),
            replacement: "/".into(),
        }];
        r.cookie_flags = vec![CookieFlagsConfig {
            cookie: "sid".into(),
            flags: vec!["bogus".into()],
        }];
        r.next_upstream = vec!["http_999".into()];
        r.set_headers = vec![SetHeaderConfig {
            name: "Bad Header".into(),
            value: "x".into(),
        }];
        r.buffers = 0;

        let errors = validate_config(&config_with(r)).unwrap_err();
        assert_eq!(errors.len(), 7, "{errors:?}");
    }

    #[test]
    fn test_listener_and_backend_checks() {
        let mut config = config_with(route("http://web"));
        config.listener.bind_address = "nowhere".into();
        config.backends.push(BackendConfig::new("b1", "web", "localhost"));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateBackend(n) if n == "b1")));
    }

    #[test]
    fn test_header_value_with_newline() {
        let mut r = route("http://web");
        r.set_headers = vec![SetHeaderConfig {
            name: "X-Ok".into(),
            value: "a\r\nInjected: 1".into(),
        }];
        assert!(validate_config(&config_with(r)).is_err());
    }
}

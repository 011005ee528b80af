//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration.
    pub listener: ListenerConfig,

    /// Routes (locations) with their proxy settings.
    pub routes: Vec<RouteConfig>,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,

    /// Upstream timeouts.
    pub timeouts: TimeoutConfig,

    /// Upstream connection reuse.
    pub keepalive: KeepaliveConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Largest client body the gateway will buffer in memory.
    pub client_max_body_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            client_max_body_size: 1024 * 1024,
        }
    }
}

/// A `pattern` / `replacement` pair. Patterns starting with `~` are
/// case-sensitive regexes, `~*` case-insensitive ones.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RewriteConfig {
    pub pattern: String,
    pub replacement: String,
}

/// Flag edits for cookies whose name matches `cookie`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CookieFlagsConfig {
    pub cookie: String,
    pub flags: Vec<String>,
}

/// One outgoing header. An empty value removes the header.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SetHeaderConfig {
    pub name: String,
    pub value: String,
}

/// Route configuration: match conditions plus the proxy settings of the
/// matched location.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match; also the location replaced by the proxy_pass URI.
    pub path_prefix: Option<String>,

    /// Route priority (higher = checked first).
    pub priority: u32,

    /// Upstream URL: `http://<backend-group>[:port][/uri]`.
    pub proxy_pass: String,

    /// HTTP version spoken to the upstream, "1.0" or "1.1".
    pub http_version: String,

    /// Method sent upstream instead of the client's.
    pub method: Option<String>,

    /// Outgoing headers, applied over the default set.
    pub set_headers: Vec<SetHeaderConfig>,

    pub pass_request_headers: bool,
    pub pass_request_body: bool,

    /// Body sent instead of the client's; may reference variables.
    pub set_body: Option<String>,

    /// Extra upstream response headers not to forward.
    pub hide_headers: Vec<String>,

    /// Response headers hidden by default that should be forwarded.
    pub pass_headers: Vec<String>,

    /// Add the rule derived from `proxy_pass` and the location.
    pub redirect_default: bool,
    pub redirects: Vec<RewriteConfig>,
    pub cookie_domains: Vec<RewriteConfig>,
    pub cookie_paths: Vec<RewriteConfig>,
    pub cookie_flags: Vec<CookieFlagsConfig>,

    /// Buffer upstream responses (pipe mode).
    pub buffering: bool,

    /// Read the whole client body before contacting the upstream.
    pub request_buffering: bool,

    /// Size of the response head buffer and of each body buffer.
    pub buffer_size: usize,

    /// Number of body buffers in pipe mode.
    pub buffers: usize,

    /// Upper bound for spilled response data; 0 disables spilling.
    pub max_temp_file_size: u64,

    /// Directory for spill files; the system temp dir when unset.
    pub temp_path: Option<String>,

    /// Keep reading the upstream response after the client went away.
    pub ignore_client_abort: bool,

    /// Treat a response without a status line as an HTTP/0.9 body.
    pub allow_http09: bool,

    /// Conditions under which the next peer is tried.
    pub next_upstream: Vec<String>,

    /// Try limit (0 = every peer of the group once).
    pub next_upstream_tries: u32,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: None,
            path_prefix: None,
            priority: 0,
            proxy_pass: String::new(),
            http_version: "1.0".to_string(),
            method: None,
            set_headers: Vec::new(),
            pass_request_headers: true,
            pass_request_body: true,
            set_body: None,
            hide_headers: Vec::new(),
            pass_headers: Vec::new(),
            redirect_default: true,
            redirects: Vec::new(),
            cookie_domains: Vec::new(),
            cookie_paths: Vec::new(),
            cookie_flags: Vec::new(),
            buffering: true,
            request_buffering: true,
            buffer_size: 4096,
            buffers: 8,
            max_temp_file_size: 1024 * 1024 * 1024,
            temp_path: None,
            ignore_client_abort: false,
            allow_http09: true,
            next_upstream: vec!["error".to_string(), "timeout".to_string()],
            next_upstream_tries: 0,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Backend group this server belongs to.
    pub group: String,

    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Maximum concurrent requests to this backend.
    #[serde(default = "default_max_backend_conns")]
    pub max_connections: usize,

    /// Failures within `fail_timeout_secs` before the backend is skipped (0 = never).
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Failure window and skip duration in seconds.
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout_secs: u64,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, group: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            address: address.into(),
            max_connections: default_max_backend_conns(),
            max_fails: default_max_fails(),
            fail_timeout_secs: default_fail_timeout(),
        }
    }
}

fn default_max_backend_conns() -> usize {
    100
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout() -> u64 {
    10
}

/// Timeout configuration for upstream operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Timeout between two successful writes to the upstream.
    pub send_secs: u64,

    /// Timeout between two successful reads from the upstream.
    pub read_secs: u64,

    /// Deadline for producing the response head to the client.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            send_secs: 60,
            read_secs: 60,
            request_secs: 120,
        }
    }
}

/// Upstream keepalive configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Reuse upstream connections (requires `http_version = "1.1"` on the route).
    pub enabled: bool,

    /// Idle connections kept per backend.
    pub max_idle_per_peer: usize,

    /// Idle connections older than this are closed.
    pub idle_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_idle_per_peer: 32,
            idle_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

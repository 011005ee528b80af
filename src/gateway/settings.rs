//! Per-route proxy settings, compiled once from configuration.

use std::collections::HashSet;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::{KeepaliveConfig, RewriteConfig, RouteConfig};
use crate::proto::HttpVersion;
use crate::resilience::{NextUpstream, UnknownCondition};
use crate::rewrite::{CookieFlagRule, CookieRewriter, Pattern, RedirectRewriter, RewriteError, RewriteRule, Template};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid proxy_pass {url:?}: {reason}")]
    InvalidProxyPass { url: String, reason: String },

    #[error("unsupported upstream scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid http_version {0:?}")]
    InvalidHttpVersion(String),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    NextUpstream(#[from] UnknownCondition),
}

/// Parsed `proxy_pass` URL: `http://<group>[:port][/uri]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPass {
    pub group: String,
    pub port: Option<u16>,
    /// The URI part, `None` when the URL ends after the authority.
    pub uri: Option<String>,
}

impl ProxyPass {
    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        let invalid = |reason: &str| SettingsError::InvalidProxyPass {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "http" => {}
            "https" => return Err(SettingsError::UnsupportedScheme("https".to_string())),
            _ => return Err(invalid("scheme must be http")),
        }
        let group = url.host_str().ok_or_else(|| invalid("missing backend group"))?;

        let after_scheme = raw.split_once("://").map(|(_, rest)| rest).unwrap_or_default();
        let uri = after_scheme.find('/').map(|at| after_scheme[at..].to_string());

        Ok(Self {
            group: group.to_string(),
            port: url.port(),
            uri,
        })
    }

    /// Value for `$proxy_host`.
    pub fn host_header(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.group, port),
            None => self.group.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(80)
    }
}

/// One outgoing header template.
#[derive(Debug, Clone)]
pub struct HeaderTemplate {
    pub name: String,
    pub lowcase: String,
    pub value: Template,
}

/// Everything the request builder, response processor and pump need to
/// know about a route.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub name: String,
    pub location: String,
    pub proxy_pass: ProxyPass,
    pub http_version: HttpVersion,
    pub method: Option<String>,
    pub headers: Vec<HeaderTemplate>,
    pub pass_request_headers: bool,
    pub pass_request_body: bool,
    pub body: Option<Template>,
    hide_headers: HashSet<Vec<u8>>,
    pass_headers: HashSet<Vec<u8>>,
    pub redirects: RedirectRewriter,
    pub cookies: CookieRewriter,
    pub buffering: bool,
    pub request_buffering: bool,
    pub buffer_size: usize,
    pub buffers: usize,
    pub max_temp_file_size: u64,
    pub temp_path: Option<PathBuf>,
    pub ignore_client_abort: bool,
    pub allow_http09: bool,
    pub next_upstream: NextUpstream,
    /// Upstream connections may be reused.
    pub keepalive: bool,
}

impl GatewaySettings {
    pub fn compile(route: &RouteConfig, keepalive: &KeepaliveConfig) -> Result<Self, SettingsError> {
        let proxy_pass = ProxyPass::parse(&route.proxy_pass)?;
        let http_version = parse_http_version(&route.http_version)?;
        let location = route.path_prefix.clone().unwrap_or_else(|| "/".to_string());
        let keepalive = keepalive.enabled && http_version == HttpVersion::HTTP_11;

        let mut headers = default_headers(keepalive);
        for set in &route.set_headers {
            let lowcase = set.name.to_ascii_lowercase();
            let header = HeaderTemplate {
                name: set.name.clone(),
                lowcase,
                value: Template::compile(&set.value),
            };
            match headers.iter_mut().find(|h| h.lowcase == header.lowcase) {
                Some(existing) => *existing = header,
                None => headers.push(header),
            }
        }

        let rules = compile_rules(&route.redirects)?;
        let default = if route.redirect_default {
            let uri = proxy_pass.uri.as_deref();
            let pattern = format!("http://{}{}", proxy_pass.host_header(), uri.unwrap_or("/"));
            let replacement = if uri.is_some() { location.as_str() } else { "/" };
            Some(RewriteRule::new(
                Pattern::Literal(pattern.into_bytes()),
                Template::literal(replacement.as_bytes()),
            ))
        } else {
            None
        };
        let redirects = RedirectRewriter::new(rules, default);

        let cookies = CookieRewriter::new(
            compile_rules(&route.cookie_domains)?,
            compile_rules(&route.cookie_paths)?,
            route
                .cookie_flags
                .iter()
                .map(|c| CookieFlagRule::parse(&c.cookie, &c.flags))
                .collect::<Result<_, _>>()?,
        );

        Ok(Self {
            name: route.name.clone(),
            location,
            proxy_pass,
            http_version,
            method: route.method.clone(),
            headers,
            pass_request_headers: route.pass_request_headers,
            pass_request_body: route.pass_request_body,
            body: route.set_body.as_deref().map(Template::compile),
            hide_headers: lowercase_set(&route.hide_headers),
            pass_headers: lowercase_set(&route.pass_headers),
            redirects,
            cookies,
            buffering: route.buffering,
            request_buffering: route.request_buffering,
            buffer_size: route.buffer_size,
            buffers: route.buffers,
            max_temp_file_size: route.max_temp_file_size,
            temp_path: route.temp_path.as_ref().map(PathBuf::from),
            ignore_client_abort: route.ignore_client_abort,
            allow_http09: route.allow_http09,
            next_upstream: NextUpstream::parse(&route.next_upstream, route.next_upstream_tries)?,
            keepalive,
        })
    }

    /// Whether an upstream response header (lower-cased name) is dropped.
    /// Hop-by-hop headers are handled separately and never reach this.
    pub fn hides(&self, lowcase: &[u8]) -> bool {
        if self.hide_headers.contains(lowcase) {
            return true;
        }
        if self.pass_headers.contains(lowcase) {
            return false;
        }
        matches!(lowcase, b"date" | b"server" | b"x-pad") || lowcase.starts_with(b"x-accel-")
    }

    /// Whether a client request header is replaced by an outgoing template.
    pub fn overrides(&self, lowcase: &str) -> bool {
        self.headers.iter().any(|h| h.lowcase == lowcase)
    }
}

pub fn parse_http_version(raw: &str) -> Result<HttpVersion, SettingsError> {
    match raw {
        "1.0" => Ok(HttpVersion::HTTP_10),
        "1.1" => Ok(HttpVersion::HTTP_11),
        other => Err(SettingsError::InvalidHttpVersion(other.to_string())),
    }
}

fn compile_rules(rules: &[RewriteConfig]) -> Result<Vec<RewriteRule>, RewriteError> {
    rules
        .iter()
        .map(|r| RewriteRule::parse(&r.pattern, &r.replacement))
        .collect()
}

fn lowercase_set(names: &[String]) -> HashSet<Vec<u8>> {
    names.iter().map(|n| n.to_ascii_lowercase().into_bytes()).collect()
}

fn default_headers(keepalive: bool) -> Vec<HeaderTemplate> {
    let connection = if keepalive { "" } else { "close" };
    [
        ("Host", "$proxy_host"),
        ("Connection", connection),
        ("Content-Length", "$proxy_internal_body_length"),
        ("Transfer-Encoding", "$proxy_internal_chunked"),
        ("TE", ""),
        ("Keep-Alive", ""),
        ("Expect", ""),
        ("Upgrade", ""),
    ]
    .into_iter()
    .map(|(name, value)| HeaderTemplate {
        name: name.to_string(),
        lowcase: name.to_ascii_lowercase(),
        value: Template::compile(value),
    })
    .collect()
}

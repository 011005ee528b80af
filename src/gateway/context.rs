//! Request-scoped proxy state.
//!
//! One `ProxyContext` is created per downstream request and dropped with it.
//! It owns the client request snapshot, the values computed while building
//! the upstream request, and answers template `$variables`.

use std::borrow::Cow;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::gateway::error::GatewayError;
use crate::gateway::settings::GatewaySettings;
use crate::proto::HttpVersion;
use crate::rewrite::VariableSource;

/// The downstream request as the gateway sees it. Header names are lower-case.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: String,
    /// Raw request target: path plus optional `?query`.
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<(String, Vec<u8>)>,
    pub remote_addr: Option<SocketAddr>,
    pub scheme: String,
}

impl ClientRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: HttpVersion::HTTP_11,
            headers: Vec::new(),
            remote_addr: None,
            scheme: "http".to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.as_ref().to_vec()));
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// First value of header `name` (lower-case).
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(path, _)| path)
    }

    pub fn args(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, args)| args)
    }

    /// Declared body length. `None` when absent or unparsable.
    pub fn content_length(&self) -> Option<u64> {
        let raw = self.header("content-length")?;
        std::str::from_utf8(raw).ok()?.trim().parse().ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n == "transfer-encoding")
            .any(|(_, v)| {
                v.split(|&c| c == b',')
                    .any(|coding| coding.trim_ascii().eq_ignore_ascii_case(b"chunked"))
            })
    }

    /// Reject transfer codings other than `chunked`. The body is re-framed
    /// upstream, so any other coding would be silently dropped.
    pub fn check_transfer_coding(&self) -> Result<(), GatewayError> {
        let unsupported = self
            .headers
            .iter()
            .filter(|(n, _)| n == "transfer-encoding")
            .flat_map(|(_, v)| v.split(|&c| c == b','))
            .map(<[u8]>::trim_ascii)
            .find(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case(b"chunked"));
        match unsupported {
            Some(coding) => Err(GatewayError::Client(format!(
                "unsupported transfer coding {:?}",
                String::from_utf8_lossy(coding)
            ))),
            None => Ok(()),
        }
    }

    pub fn has_body(&self) -> bool {
        self.is_chunked() || self.content_length().is_some_and(|n| n > 0)
    }
}

/// Per-request gateway state.
///
/// Body transfer state (chunk decoder, free and busy buffers) is owned by the
/// transfer task's `TransferPump`, not by the context.
#[derive(Debug)]
pub struct ProxyContext {
    pub request_id: String,
    pub client: ClientRequest,
    proxy_host: String,
    proxy_port: String,
    method_override: Option<String>,
    body_length: Option<u64>,
    body_chunked: bool,
    buffered_body: Option<Bytes>,
}

impl ProxyContext {
    pub fn new(request_id: impl Into<String>, client: ClientRequest, settings: &GatewaySettings) -> Self {
        Self {
            request_id: request_id.into(),
            client,
            proxy_host: settings.proxy_pass.host_header(),
            proxy_port: settings.proxy_pass.port().to_string(),
            method_override: None,
            body_length: None,
            body_chunked: false,
            buffered_body: None,
        }
    }

    /// Force the upstream method regardless of configuration.
    pub fn override_method(&mut self, method: impl Into<String>) {
        self.method_override = Some(method.into());
    }

    pub fn method_override(&self) -> Option<&str> {
        self.method_override.as_deref()
    }

    /// Record the fully read client body.
    pub fn set_buffered_body(&mut self, body: Bytes) {
        self.buffered_body = Some(body);
    }

    pub fn buffered_body(&self) -> Option<&Bytes> {
        self.buffered_body.as_ref()
    }

    /// Body framing of the outgoing request, set by the request builder.
    pub fn set_body_declaration(&mut self, length: Option<u64>, chunked: bool) {
        self.body_length = length;
        self.body_chunked = chunked;
    }

    fn forwarded_for(&self) -> Vec<u8> {
        let ip = self.client.remote_addr.map(|a| a.ip().to_string());
        let existing: Vec<&[u8]> = self
            .client
            .headers
            .iter()
            .filter(|(n, _)| n == "x-forwarded-for")
            .map(|(_, v)| v.as_slice())
            .collect();

        let mut out = existing.join(&b", "[..]);
        if let Some(ip) = ip {
            if !out.is_empty() {
                out.extend_from_slice(b", ");
            }
            out.extend_from_slice(ip.as_bytes());
        }
        out
    }

    fn host(&self) -> Vec<u8> {
        let Some(host) = self.client.header("host") else {
            return Vec::new();
        };
        // Strip the port, keeping bracketed IPv6 literals intact.
        let end = match host.iter().rposition(|&c| c == b':') {
            Some(colon) if !host[colon..].contains(&b']') => colon,
            _ => host.len(),
        };
        host[..end].to_ascii_lowercase()
    }
}

impl VariableSource for ProxyContext {
    fn variable(&self, name: &str) -> Option<Cow<'_, [u8]>> {
        match name {
            "proxy_host" => Some(Cow::Borrowed(self.proxy_host.as_bytes())),
            "proxy_port" => Some(Cow::Borrowed(self.proxy_port.as_bytes())),
            "proxy_add_x_forwarded_for" => Some(Cow::Owned(self.forwarded_for())),
            "proxy_internal_body_length" => self.body_length.map(|n| Cow::Owned(n.to_string().into_bytes())),
            "proxy_internal_chunked" => self.body_chunked.then_some(Cow::Borrowed(&b"chunked"[..])),
            "host" => Some(Cow::Owned(self.host())),
            "remote_addr" => self
                .client
                .remote_addr
                .map(|a| Cow::Owned(a.ip().to_string().into_bytes())),
            "scheme" => text(&self.client.scheme),
            "request_method" => text(&self.client.method),
            "request_uri" => text(&self.client.target),
            "uri" => text(self.client.path()),
            "args" => self.client.args().and_then(text),
            "request_id" => text(&self.request_id),
            _ => {
                let header = name.strip_prefix("http_")?.replace('_', "-");
                self.client.header(&header).map(Cow::Borrowed)
            }
        }
    }
}

fn text(s: &str) -> Option<Cow<'_, [u8]>> {
    Some(Cow::Borrowed(s.as_bytes()))
}

//! Upstream request construction.
//!
//! # Responsibilities
//! - Pick the upstream method (override > configured > original)
//! - Compute the request target from `proxy_pass` and the matched location
//! - Evaluate the outgoing header templates and append pass-through client headers
//! - Declare the outgoing body framing and whether it can be streamed
//!
//! # Design Decisions
//! - A configured body always wins over the client's `Content-Length` and
//!   `Transfer-Encoding`; the client body is then never read
//! - A chunked client body is re-chunked only towards HTTP/1.1 upstreams;
//!   HTTP/1.0 upstreams get the buffered body with a `Content-Length`
//! - A header whose template evaluates to nothing is not sent

use bytes::{BufMut, Bytes, BytesMut};
use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};

use crate::gateway::context::ProxyContext;
use crate::gateway::error::GatewayError;
use crate::gateway::settings::GatewaySettings;
use crate::proto::{FrameLength, HttpVersion};

/// Bytes escaped when a client path is copied into the upstream target.
const PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(0x7f);

/// The body that follows the outgoing head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingBody {
    None,
    /// Known in full before sending: a configured body or the buffered client body.
    Buffered(Bytes),
    /// The client body, forwarded while it arrives with this framing.
    Stream(FrameLength),
}

/// A serialized upstream request head plus its body declaration.
#[derive(Debug, Clone)]
pub struct OutgoingHead {
    pub method: String,
    pub uri: String,
    pub version: HttpVersion,
    pub head: Bytes,
    pub body: OutgoingBody,
}

impl OutgoingHead {
    /// The body is forwarded without reading it fully first.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, OutgoingBody::Stream(_))
    }

    /// The request can be sent again to another peer.
    pub fn is_replayable(&self) -> bool {
        !self.is_streaming()
    }
}

/// Builds upstream requests for one route.
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder<'a> {
    settings: &'a GatewaySettings,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(settings: &'a GatewaySettings) -> Self {
        Self { settings }
    }

    /// Whether the client body must be read completely before `build`.
    pub fn needs_buffering(&self, ctx: &ProxyContext) -> bool {
        let s = self.settings;
        if s.body.is_some() || !s.pass_request_body || !ctx.client.has_body() {
            return false;
        }
        s.request_buffering || (ctx.client.is_chunked() && s.http_version < HttpVersion::HTTP_11)
    }

    pub fn build(&self, ctx: &mut ProxyContext) -> Result<OutgoingHead, GatewayError> {
        let s = self.settings;

        let method = ctx
            .method_override()
            .or(s.method.as_deref())
            .unwrap_or(&ctx.client.method)
            .to_string();
        let uri = self.target_uri(ctx);
        let body = self.body(ctx)?;

        let mut head = BytesMut::with_capacity(256);
        head.put_slice(method.as_bytes());
        head.put_u8(b' ');
        head.put_slice(uri.as_bytes());
        head.put_u8(b' ');
        head.put_slice(s.http_version.to_string().as_bytes());
        head.put_slice(b"\r\n");

        for header in &s.headers {
            let value = header.value.evaluate(ctx, None);
            if value.is_empty() {
                continue;
            }
            put_header(&mut head, header.name.as_bytes(), &value);
        }

        if s.pass_request_headers {
            for (name, value) in &ctx.client.headers {
                if s.overrides(name) {
                    continue;
                }
                put_header(&mut head, name.as_bytes(), value);
            }
        }
        head.put_slice(b"\r\n");

        tracing::debug!(
            request_id = %ctx.request_id,
            method = %method,
            uri = %uri,
            streaming = matches!(body, OutgoingBody::Stream(_)),
            "Built upstream request"
        );

        Ok(OutgoingHead {
            method,
            uri,
            version: s.http_version,
            head: head.freeze(),
            body,
        })
    }

    fn target_uri(&self, ctx: &ProxyContext) -> String {
        let Some(base) = self.settings.proxy_pass.uri.as_deref() else {
            return ctx.client.target.clone();
        };

        let path = ctx.client.path();
        let rest = path.strip_prefix(self.settings.location.as_str()).unwrap_or(path);
        let decoded: Vec<u8> = percent_decode_str(rest).collect();

        let mut uri = String::with_capacity(base.len() + rest.len() + 16);
        uri.push_str(base);
        if uri.ends_with('/') && decoded.first() == Some(&b'/') {
            uri.pop();
        }
        uri.extend(percent_encode(&decoded, PATH));
        if let Some(args) = ctx.client.args() {
            uri.push('?');
            uri.push_str(args);
        }
        uri
    }

    fn body(&self, ctx: &mut ProxyContext) -> Result<OutgoingBody, GatewayError> {
        let s = self.settings;

        if let Some(template) = &s.body {
            let body = Bytes::from(template.evaluate(ctx, None));
            ctx.set_body_declaration(Some(body.len() as u64), false);
            return Ok(OutgoingBody::Buffered(body));
        }
        if !s.pass_request_body {
            ctx.set_body_declaration(None, false);
            return Ok(OutgoingBody::None);
        }
        if ctx.client.header("content-length").is_some() && ctx.client.content_length().is_none() {
            return Err(GatewayError::Client("invalid Content-Length".to_string()));
        }

        if let Some(body) = ctx.buffered_body().cloned() {
            if ctx.client.has_body() {
                ctx.set_body_declaration(Some(body.len() as u64), false);
                return Ok(OutgoingBody::Buffered(body));
            }
        } else if self.needs_buffering(ctx) {
            return Err(GatewayError::Internal("client body was not buffered".to_string()));
        }

        if ctx.client.is_chunked() {
            ctx.set_body_declaration(None, true);
            return Ok(OutgoingBody::Stream(FrameLength::Chunked));
        }
        match ctx.client.content_length() {
            Some(0) => {
                ctx.set_body_declaration(Some(0), false);
                Ok(OutgoingBody::None)
            }
            Some(n) => {
                ctx.set_body_declaration(Some(n), false);
                Ok(OutgoingBody::Stream(FrameLength::Fixed(n as i64)))
            }
            None => {
                ctx.set_body_declaration(None, false);
                Ok(OutgoingBody::None)
            }
        }
    }
}

fn put_header(head: &mut BytesMut, name: &[u8], value: &[u8]) {
    head.put_slice(name);
    head.put_slice(b": ");
    head.put_slice(value);
    head.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeepaliveConfig, RouteConfig, SetHeaderConfig};
    use crate::gateway::context::ClientRequest;

    fn settings(route: RouteConfig) -> GatewaySettings {
        GatewaySettings::compile(&route, &KeepaliveConfig::default()).unwrap()
    }

    fn route(proxy_pass: &str) -> RouteConfig {
        RouteConfig {
            path_prefix: Some("/app/".into()),
            proxy_pass: proxy_pass.into(),
            ..Default::default()
        }
    }

    fn head_text(head: &OutgoingHead) -> String {
        String::from_utf8(head.head.to_vec()).unwrap()
    }

    #[test]
    fn test_default_head() {
        let s = settings(route("http://web:8080"));
        let client = ClientRequest::new("GET", "/app/x?y=1")
            .with_header("Host", "front.example")
            .with_header("Connection", "keep-alive")
            .with_header("Accept", "*/*")
            .with_header("TE", "trailers");
        let mut ctx = ProxyContext::new("id", client, &s);

        let out = RequestBuilder::new(&s).build(&mut ctx).unwrap();
        assert_eq!(out.body, OutgoingBody::None);
        assert_eq!(
            head_text(&out),
            "GET /app/x?y=1 HTTP/1.0\r\nHost: web:8080\r\nConnection: close\r\naccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_uri_replaces_location_and_escapes_rest() {
        let s = settings(route("http://web/api/"));
        let client = ClientRequest::new("GET", "/app/a%20b/c d?q=%20");
        let mut ctx = ProxyContext::new("id", client, &s);
        let out = RequestBuilder::new(&s).build(&mut ctx).unwrap();
        assert_eq!(out.uri, "/api/a%20b/c%20d?q=%20");
    }

    #[test]
    fn test_method_precedence() {
        let mut r = route("http://web");
        r.method = Some("POST".into());
        let s = settings(r);
        let mut ctx = ProxyContext::new("id", ClientRequest::new("GET", "/"), &s);
        assert_eq!(RequestBuilder::new(&s).build(&mut ctx).unwrap().method, "POST");

        ctx.override_method("HEAD");
        assert_eq!(RequestBuilder::new(&s).build(&mut ctx).unwrap().method, "HEAD");

        let plain = settings(route("http://web"));
        let mut ctx = ProxyContext::new("id", ClientRequest::new("DELETE", "/"), &plain);
        assert_eq!(RequestBuilder::new(&plain).build(&mut ctx).unwrap().method, "DELETE");
    }

    #[test]
    fn test_configured_body_wins_over_client_framing() {
        let mut r = route("http://web");
        r.set_body = Some("user=$http_x_user".into());
        let s = settings(r);
        let client = ClientRequest::new("POST", "/")
            .with_header("Transfer-Encoding", "chunked")
            .with_header("Content-Length", "999")
            .with_header("X-User", "ann");
        let mut ctx = ProxyContext::new("id", client, &s);

        let builder = RequestBuilder::new(&s);
        assert!(!builder.needs_buffering(&ctx));
        let out = builder.build(&mut ctx).unwrap();
        assert_eq!(out.body, OutgoingBody::Buffered(Bytes::from_static(b"user=ann")));
        let text = head_text(&out);
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(!text.contains("chunked"));
        assert!(!text.contains("999"));
        assert!(out.is_replayable());
    }

    #[test]
    fn test_chunked_body_streams_to_http11() {
        let mut r = route("http://web");
        r.http_version = "1.1".into();
        r.request_buffering = false;
        let s = settings(r);
        let client = ClientRequest::new("POST", "/").with_header("Transfer-Encoding", "chunked");
        let mut ctx = ProxyContext::new("id", client, &s);

        let builder = RequestBuilder::new(&s);
        assert!(!builder.needs_buffering(&ctx));
        let out = builder.build(&mut ctx).unwrap();
        assert_eq!(out.body, OutgoingBody::Stream(FrameLength::Chunked));
        assert!(out.is_streaming());
        assert!(head_text(&out).contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn test_chunked_body_buffered_for_http10() {
        let mut r = route("http://web");
        r.request_buffering = false;
        let s = settings(r);
        let client = ClientRequest::new("POST", "/").with_header("Transfer-Encoding", "chunked");
        let mut ctx = ProxyContext::new("id", client, &s);

        let builder = RequestBuilder::new(&s);
        assert!(builder.needs_buffering(&ctx));
        assert!(matches!(builder.build(&mut ctx), Err(GatewayError::Internal(_))));

        ctx.set_buffered_body(Bytes::from_static(b"hello"));
        let out = builder.build(&mut ctx).unwrap();
        assert_eq!(out.body, OutgoingBody::Buffered(Bytes::from_static(b"hello")));
        let text = head_text(&out);
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
    }

    #[test]
    fn test_fixed_body_streams_when_unbuffered() {
        let mut r = route("http://web");
        r.request_buffering = false;
        let s = settings(r);
        let client = ClientRequest::new("PUT", "/").with_header("Content-Length", "10");
        let mut ctx = ProxyContext::new("id", client, &s);
        let out = RequestBuilder::new(&s).build(&mut ctx).unwrap();
        assert_eq!(out.body, OutgoingBody::Stream(FrameLength::Fixed(10)));
        assert!(head_text(&out).contains("Content-Length: 10\r\n"));
        assert!(!out.is_replayable());
    }

    #[test]
    fn test_pass_request_body_off() {
        let mut r = route("http://web");
        r.pass_request_body = false;
        let s = settings(r);
        let client = ClientRequest::new("POST", "/").with_header("Content-Length", "3");
        let mut ctx = ProxyContext::new("id", client, &s);
        let out = RequestBuilder::new(&s).build(&mut ctx).unwrap();
        assert_eq!(out.body, OutgoingBody::None);
        assert!(!head_text(&out).contains("Content-Length"));
    }

    #[test]
    fn test_set_headers_and_hidden_client_headers() {
        let mut r = route("http://web");
        r.pass_request_headers = true;
        r.set_headers = vec![
            SetHeaderConfig {
                name: "X-Forwarded-For".into(),
                value: "$proxy_add_x_forwarded_for".into(),
            },
            SetHeaderConfig {
                name: "Cookie".into(),
                value: String::new(),
            },
        ];
        let s = settings(r);
        let client = ClientRequest::new("GET", "/")
            .with_header("Cookie", "a=b")
            .with_header("X-Forwarded-For", "1.1.1.1")
            .with_remote_addr("10.0.0.2:5000".parse().unwrap());
        let mut ctx = ProxyContext::new("id", client, &s);
        let text = head_text(&RequestBuilder::new(&s).build(&mut ctx).unwrap());
        assert!(text.contains("X-Forwarded-For: 1.1.1.1, 10.0.0.2\r\n"));
        assert!(!text.to_ascii_lowercase().contains("cookie"));
        assert_eq!(text.matches("orwarded-For").count(), 1);
    }

    #[test]
    fn test_invalid_client_content_length() {
        let mut r = route("http://web");
        r.request_buffering = false;
        let s = settings(r);
        let client = ClientRequest::new("POST", "/").with_header("Content-Length", "12x");
        let mut ctx = ProxyContext::new("id", client, &s);
        let err = RequestBuilder::new(&s).build(&mut ctx).unwrap_err();
        assert_eq!(err.status(), 400);
    }
}

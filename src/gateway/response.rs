//! Upstream response head processing.
//!
//! # Responsibilities
//! - Interpret framing headers and reject contradictory ones
//! - Drop hop-by-hop and hidden headers
//! - Rewrite `Location`, `Refresh` and `Set-Cookie`
//! - Decide whether the peer allows connection reuse
//!
//! # Design Decisions
//! - Header handlers are picked by `KnownHeader` variant, everything else is
//!   a plain pass-through
//! - Framing problems are `invalid_header` failures so they can trigger
//!   `next_upstream`

use crate::gateway::error::{FailureKind, GatewayError};
use crate::gateway::settings::GatewaySettings;
use crate::proto::{FrameLength, HeaderLine, HttpVersion, KnownHeader, StatusLine};
use crate::rewrite::VariableSource;

/// A processed upstream response head, ready to be sent downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamHead {
    pub status: u16,
    pub version: HttpVersion,
    pub reason: Vec<u8>,
    /// Forwarded headers, names as the upstream sent them.
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub frame: FrameLength,
    /// The peer allows the connection to be reused after this response.
    pub keepalive: bool,
    /// Pipe mode for this response.
    pub buffering: bool,
}

impl UpstreamHead {
    /// Head used when the upstream answered without a status line.
    pub fn http09(settings: &GatewaySettings) -> Self {
        Self {
            status: 200,
            version: HttpVersion::HTTP_09,
            reason: b"OK".to_vec(),
            headers: Vec::new(),
            frame: FrameLength::UntilClose,
            keepalive: false,
            buffering: settings.buffering,
        }
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v.as_slice())
    }
}

/// Consumes header lines one at a time and produces an [`UpstreamHead`].
pub struct ResponseProcessor<'a> {
    settings: &'a GatewaySettings,
    vars: &'a (dyn VariableSource + Sync),
    head_request: bool,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    content_length: Option<i64>,
    chunked: bool,
    connection_close: bool,
    connection_keepalive: bool,
    seen_server: bool,
    seen_date: bool,
    buffering: Option<bool>,
}

impl<'a> ResponseProcessor<'a> {
    pub fn new(settings: &'a GatewaySettings, vars: &'a (dyn VariableSource + Sync), head_request: bool) -> Self {
        Self {
            settings,
            vars,
            head_request,
            headers: Vec::new(),
            content_length: None,
            chunked: false,
            connection_close: false,
            connection_keepalive: false,
            seen_server: false,
            seen_date: false,
            buffering: None,
        }
    }

    /// Handle one parsed header line; `buf` is the head buffer its spans point into.
    pub fn header(&mut self, buf: &[u8], line: &HeaderLine) -> Result<(), GatewayError> {
        let (Some(name), Some(value)) = (line.name.slice(buf), line.value.slice(buf)) else {
            return Err(GatewayError::Internal("header span outside head buffer".to_string()));
        };
        let mut value = value.to_vec();

        if let Some(known) = line.known() {
            match known {
                KnownHeader::ContentLength => self.content_length(&value)?,
                KnownHeader::TransferEncoding => {
                    if !value.trim_ascii().eq_ignore_ascii_case(b"chunked") {
                        return Err(invalid("unknown transfer encoding"));
                    }
                    self.chunked = true;
                }
                KnownHeader::Connection => {
                    for token in value.split(|&c| c == b',').map(<[u8]>::trim_ascii) {
                        if token.eq_ignore_ascii_case(b"close") {
                            self.connection_close = true;
                        } else if token.eq_ignore_ascii_case(b"keep-alive") {
                            self.connection_keepalive = true;
                        }
                    }
                }
                KnownHeader::XAccelBuffering => {
                    let v = value.trim_ascii();
                    if v.eq_ignore_ascii_case(b"yes") {
                        self.buffering = Some(true);
                    } else if v.eq_ignore_ascii_case(b"no") {
                        self.buffering = Some(false);
                    }
                }
                KnownHeader::Location => {
                    self.settings.redirects.rewrite_location(&mut value, self.vars)?;
                }
                KnownHeader::Refresh => {
                    self.settings.redirects.rewrite_refresh(&mut value, self.vars)?;
                }
                KnownHeader::SetCookie => {
                    if let Some(rewritten) = self.settings.cookies.rewrite(&value, self.vars)? {
                        value = rewritten;
                    }
                }
                KnownHeader::Server => self.seen_server = true,
                KnownHeader::Date => self.seen_date = true,
                _ => {}
            }
            if known.is_hop_by_hop() {
                return Ok(());
            }
        }

        if self.settings.hides(line.lowcase_name()) {
            return Ok(());
        }
        self.headers.push((name.to_vec(), value));
        Ok(())
    }

    fn content_length(&mut self, value: &[u8]) -> Result<(), GatewayError> {
        let digits = value.trim_ascii();
        if digits.is_empty() || digits.len() > 18 || !digits.iter().all(u8::is_ascii_digit) {
            return Err(invalid("invalid Content-Length"));
        }
        let n = digits.iter().fold(0i64, |n, d| n * 10 + i64::from(d - b'0'));
        match self.content_length {
            Some(prev) if prev != n => Err(invalid("conflicting Content-Length headers")),
            _ => {
                self.content_length = Some(n);
                Ok(())
            }
        }
    }

    /// All headers seen: settle framing and reuse.
    pub fn finish(mut self, buf: &[u8], status: &StatusLine) -> Result<UpstreamHead, GatewayError> {
        if self.chunked && self.content_length.is_some() {
            return Err(invalid("both Content-Length and Transfer-Encoding"));
        }
        if self.chunked && status.version < HttpVersion::HTTP_11 {
            return Err(invalid("chunked response from HTTP/1.0 upstream"));
        }

        if !self.seen_server {
            self.headers.push((b"Server".to_vec(), Vec::new()));
        }
        if !self.seen_date {
            self.headers.push((b"Date".to_vec(), Vec::new()));
        }

        let frame = FrameLength::for_response(status.code, self.head_request, self.content_length, self.chunked);
        let peer_allows = if status.version >= HttpVersion::HTTP_11 {
            !self.connection_close
        } else {
            self.connection_keepalive && !self.connection_close
        };
        let keepalive = peer_allows && frame != FrameLength::UntilClose;

        Ok(UpstreamHead {
            status: status.code,
            version: status.version,
            reason: status.reason.slice(buf).unwrap_or_default().to_vec(),
            headers: self.headers,
            frame,
            keepalive,
            buffering: self.buffering.unwrap_or(self.settings.buffering),
        })
    }
}

fn invalid(reason: &str) -> GatewayError {
    GatewayError::upstream(FailureKind::InvalidHeader, reason)
}

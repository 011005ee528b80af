//! Incremental response head parser.
//!
//! The caller accumulates upstream bytes in one growing buffer and passes the
//! whole buffer on every call; the parser remembers how far it scanned and
//! resumes there. All spans are offsets into that buffer, so they stay valid
//! when the buffer reallocates.

use crate::proto::Span;

/// Header names up to this length are lower-cased into an inline buffer.
pub const LOWCASE_INLINE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
    pub major: u16,
    pub minor: u16,
}

impl HttpVersion {
    pub const HTTP_09: HttpVersion = HttpVersion { major: 0, minor: 9 };
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Parsed status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLine {
    pub version: HttpVersion,
    pub code: u16,
    /// The whole line without its terminator.
    pub line: Span,
    /// Reason phrase, possibly empty.
    pub reason: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusParse {
    Ok(StatusLine),
    Again,
    Error,
}

/// Well-known response headers that get a dedicated handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownHeader {
    ContentLength,
    TransferEncoding,
    Connection,
    KeepAlive,
    ProxyConnection,
    Te,
    Trailer,
    Upgrade,
    SetCookie,
    Location,
    Refresh,
    Server,
    Date,
    XPad,
    XAccelBuffering,
    /// Any other `X-Accel-*` control header.
    XAccel,
}

impl KnownHeader {
    /// Dispatch on an already lower-cased header name.
    pub fn lookup(lowcase: &[u8]) -> Option<KnownHeader> {
        let known = match lowcase {
            b"content-length" => KnownHeader::ContentLength,
            b"transfer-encoding" => KnownHeader::TransferEncoding,
            b"connection" => KnownHeader::Connection,
            b"keep-alive" => KnownHeader::KeepAlive,
            b"proxy-connection" => KnownHeader::ProxyConnection,
            b"te" => KnownHeader::Te,
            b"trailer" => KnownHeader::Trailer,
            b"upgrade" => KnownHeader::Upgrade,
            b"set-cookie" => KnownHeader::SetCookie,
            b"location" => KnownHeader::Location,
            b"refresh" => KnownHeader::Refresh,
            b"server" => KnownHeader::Server,
            b"date" => KnownHeader::Date,
            b"x-pad" => KnownHeader::XPad,
            b"x-accel-buffering" => KnownHeader::XAccelBuffering,
            other if other.starts_with(b"x-accel-") => KnownHeader::XAccel,
            _ => return None,
        };
        Some(known)
    }

    /// Headers that describe one connection and are never forwarded.
    pub fn is_hop_by_hop(&self) -> bool {
        matches!(
            self,
            KnownHeader::Connection
                | KnownHeader::KeepAlive
                | KnownHeader::ProxyConnection
                | KnownHeader::Te
                | KnownHeader::Trailer
                | KnownHeader::TransferEncoding
                | KnownHeader::Upgrade
        )
    }
}

/// Lower-cased header name: inline for short names, heap for long ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerName {
    Inline { buf: [u8; LOWCASE_INLINE_LEN], len: u8 },
    Heap(Vec<u8>),
}

impl Default for LowerName {
    fn default() -> Self {
        LowerName::Inline {
            buf: [0; LOWCASE_INLINE_LEN],
            len: 0,
        }
    }
}

impl LowerName {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            LowerName::Inline { buf, len } => &buf[..usize::from(*len)],
            LowerName::Heap(v) => v,
        }
    }

    /// Append one byte; returns `false` once the inline buffer is full.
    fn push(&mut self, ch: u8) -> bool {
        match self {
            LowerName::Inline { buf, len } if usize::from(*len) < LOWCASE_INLINE_LEN => {
                buf[usize::from(*len)] = ch.to_ascii_lowercase();
                *len += 1;
                true
            }
            LowerName::Inline { .. } => false,
            LowerName::Heap(v) => {
                v.push(ch.to_ascii_lowercase());
                true
            }
        }
    }
}

/// One parsed header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub name: Span,
    pub value: Span,
    lowcase: LowerName,
    known: Option<KnownHeader>,
}

impl HeaderLine {
    pub fn lowcase_name(&self) -> &[u8] {
        self.lowcase.as_bytes()
    }

    pub fn known(&self) -> Option<KnownHeader> {
        self.known
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderParse {
    Header(HeaderLine),
    HeadersDone,
    Again,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusState {
    Start,
    H,
    Ht,
    Htt,
    Http,
    FirstMajorDigit,
    MajorDigit,
    FirstMinorDigit,
    MinorDigit,
    Status,
    SpaceAfterStatus,
    StatusText,
    AlmostDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Start,
    Name,
    SpaceBeforeValue,
    Value,
    SpaceAfterValue,
    AlmostDone,
    HeaderAlmostDone,
}

/// Resumable status-line and header-line scanner.
#[derive(Debug)]
pub struct ResponseHeadParser {
    pos: usize,
    status_state: StatusState,
    header_state: HeaderState,
    line_start: usize,
    major: u16,
    minor: u16,
    code: u16,
    digits: u8,
    reason_start: usize,
    name_end: usize,
    value_start: usize,
    value_end: usize,
    lowcase: LowerName,
    headers_done: bool,
}

impl Default for ResponseHeadParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseHeadParser {
    /// Parser expecting a status line first.
    pub fn new() -> Self {
        Self {
            pos: 0,
            status_state: StatusState::Start,
            header_state: HeaderState::Start,
            line_start: 0,
            major: 0,
            minor: 0,
            code: 0,
            digits: 0,
            reason_start: 0,
            name_end: 0,
            value_start: 0,
            value_end: 0,
            lowcase: LowerName::default(),
            headers_done: false,
        }
    }

    /// Parser positioned at a header line (used for chunked trailers).
    pub fn for_headers() -> Self {
        Self::new()
    }

    /// Offset of the first byte not yet consumed; after `HeadersDone`, where the body starts.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether the status line got past its `HTTP/` prefix. After an
    /// error, `false` means the response has no status line at all.
    pub fn saw_http_prefix(&self) -> bool {
        !matches!(
            self.status_state,
            StatusState::Start | StatusState::H | StatusState::Ht | StatusState::Htt | StatusState::Http
        )
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Scan the status line. `buf` is the whole accumulated head buffer.
    pub fn parse_status_line(&mut self, buf: &[u8]) -> StatusParse {
        use StatusState::*;

        while self.pos < buf.len() {
            let ch = buf[self.pos];
            let at = self.pos;
            self.pos += 1;

            match self.status_state {
                Start => {
                    self.line_start = at;
                    if ch != b'H' {
                        return StatusParse::Error;
                    }
                    self.status_state = H;
                }
                H | Ht | Htt | Http => {
                    let (expected, next) = match self.status_state {
                        H => (b'T', Ht),
                        Ht => (b'T', Htt),
                        Htt => (b'P', Http),
                        _ => (b'/', FirstMajorDigit),
                    };
                    if ch != expected {
                        return StatusParse::Error;
                    }
                    self.status_state = next;
                }
                FirstMajorDigit => {
                    if !ch.is_ascii_digit() {
                        return StatusParse::Error;
                    }
                    self.major = u16::from(ch - b'0');
                    self.status_state = MajorDigit;
                }
                MajorDigit => {
                    if ch == b'.' {
                        self.status_state = FirstMinorDigit;
                    } else if ch.is_ascii_digit() && self.major <= 99 {
                        self.major = self.major * 10 + u16::from(ch - b'0');
                        if self.major > 99 {
                            return StatusParse::Error;
                        }
                    } else {
                        return StatusParse::Error;
                    }
                }
                FirstMinorDigit => {
                    if !ch.is_ascii_digit() {
                        return StatusParse::Error;
                    }
                    self.minor = u16::from(ch - b'0');
                    self.status_state = MinorDigit;
                }
                MinorDigit => {
                    if ch == b' ' {
                        self.status_state = Status;
                    } else if ch.is_ascii_digit() {
                        self.minor = self.minor * 10 + u16::from(ch - b'0');
                        if self.minor > 99 {
                            return StatusParse::Error;
                        }
                    } else {
                        return StatusParse::Error;
                    }
                }
                Status => {
                    if ch == b' ' && self.digits == 0 {
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return StatusParse::Error;
                    }
                    self.code = self.code * 10 + u16::from(ch - b'0');
                    self.digits += 1;
                    if self.digits == 3 {
                        if self.code < 100 {
                            return StatusParse::Error;
                        }
                        self.status_state = SpaceAfterStatus;
                        self.reason_start = self.pos;
                    }
                }
                SpaceAfterStatus => match ch {
                    b' ' => {
                        self.reason_start = self.pos;
                        self.status_state = StatusText;
                    }
                    // IIS sub-status, e.g. "403.1".
                    b'.' => self.status_state = StatusText,
                    b'\r' => self.status_state = AlmostDone,
                    b'\n' => return self.status_done(buf, at),
                    _ => return StatusParse::Error,
                },
                StatusText => match ch {
                    b'\r' => self.status_state = AlmostDone,
                    b'\n' => return self.status_done(buf, at),
                    _ => {}
                },
                AlmostDone => {
                    if ch != b'\n' {
                        return StatusParse::Error;
                    }
                    return self.status_done(buf, at - 1);
                }
            }
        }
        StatusParse::Again
    }

    fn status_done(&mut self, buf: &[u8], line_end: usize) -> StatusParse {
        let reason_start = self.reason_start.min(line_end);
        let (Some(line), Some(reason)) = (
            Span::from_range(self.line_start..line_end, buf.len()),
            Span::from_range(reason_start..line_end, buf.len()),
        ) else {
            return StatusParse::Error;
        };
        StatusParse::Ok(StatusLine {
            version: HttpVersion {
                major: self.major,
                minor: self.minor,
            },
            code: self.code,
            line,
            reason,
        })
    }

    /// Scan the next header line. `buf` is the whole accumulated head buffer.
    pub fn parse_header_line(&mut self, buf: &[u8]) -> HeaderParse {
        use HeaderState::*;

        if self.headers_done {
            return HeaderParse::HeadersDone;
        }

        while self.pos < buf.len() {
            let ch = buf[self.pos];
            let at = self.pos;
            self.pos += 1;

            match self.header_state {
                Start => {
                    self.line_start = at;
                    self.lowcase = LowerName::default();
                    match ch {
                        b'\r' => self.header_state = HeaderAlmostDone,
                        b'\n' => return self.headers_complete(),
                        _ if is_token_char(ch) => {
                            self.lowcase.push(ch);
                            self.header_state = Name;
                        }
                        _ => return HeaderParse::Error,
                    }
                }
                Name => {
                    if ch == b':' {
                        self.name_end = at;
                        self.header_state = SpaceBeforeValue;
                    } else if is_token_char(ch) {
                        if !self.lowcase.push(ch) {
                            // too long for the inline buffer; lowered in one pass at line end
                            self.lowcase = LowerName::Heap(Vec::new());
                        }
                    } else {
                        return HeaderParse::Error;
                    }
                }
                SpaceBeforeValue => match ch {
                    b' ' | b'\t' => {}
                    b'\r' => {
                        self.value_start = at;
                        self.value_end = at;
                        self.header_state = AlmostDone;
                    }
                    b'\n' => {
                        self.value_start = at;
                        self.value_end = at;
                        return self.header_done(buf);
                    }
                    0 => return HeaderParse::Error,
                    _ => {
                        self.value_start = at;
                        self.header_state = Value;
                    }
                },
                Value => match ch {
                    b' ' | b'\t' => {
                        self.value_end = at;
                        self.header_state = SpaceAfterValue;
                    }
                    b'\r' => {
                        self.value_end = at;
                        self.header_state = AlmostDone;
                    }
                    b'\n' => {
                        self.value_end = at;
                        return self.header_done(buf);
                    }
                    0 => return HeaderParse::Error,
                    _ => {}
                },
                SpaceAfterValue => match ch {
                    b' ' | b'\t' => {}
                    b'\r' => self.header_state = AlmostDone,
                    b'\n' => return self.header_done(buf),
                    0 => return HeaderParse::Error,
                    _ => self.header_state = Value,
                },
                AlmostDone => {
                    if ch != b'\n' {
                        return HeaderParse::Error;
                    }
                    return self.header_done(buf);
                }
                HeaderAlmostDone => {
                    if ch != b'\n' {
                        return HeaderParse::Error;
                    }
                    return self.headers_complete();
                }
            }
        }
        HeaderParse::Again
    }

    fn header_done(&mut self, buf: &[u8]) -> HeaderParse {
        self.header_state = HeaderState::Start;
        let (Some(name), Some(value)) = (
            Span::from_range(self.line_start..self.name_end, buf.len()),
            Span::from_range(self.value_start..self.value_end, buf.len()),
        ) else {
            return HeaderParse::Error;
        };
        let mut lowcase = std::mem::take(&mut self.lowcase);
        if let LowerName::Heap(v) = &mut lowcase {
            *v = buf[name.range()].to_ascii_lowercase();
        }
        let known = KnownHeader::lookup(lowcase.as_bytes());
        HeaderParse::Header(HeaderLine {
            name,
            value,
            lowcase,
            known,
        })
    }

    fn headers_complete(&mut self) -> HeaderParse {
        self.headers_done = true;
        HeaderParse::HeadersDone
    }
}

/// RFC 9110 `tchar`.
fn is_token_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
        )
}

//! Chunked transfer coding.
//!
//! The decoder is a byte-at-a-time state machine: feeding a message in one
//! call or split across any number of calls yields the same payload spans
//! (concatenated) and the same terminal result.

use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::head::{HeaderParse, ResponseHeadParser};
use crate::proto::{Progress, Span};

/// Longest accepted chunk-size field, in hex digits (leading zeros count).
///
/// Fifteen digits keep the size below 2^60, so it always fits an `i64`.
pub const MAX_CHUNK_SIZE_DIGITS: usize = 15;

/// Upper bound on a single kept trailer line.
const MAX_TRAILER_LINE: usize = 8 * 1024;

/// Position of the decoder inside the chunked grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    Start,
    Size,
    Extension,
    ExtensionAlmostDone,
    Data,
    AfterData,
    AfterDataAlmostDone,
    LastChunkExtension,
    Trailer,
    TrailerAlmostDone,
    TrailerHeader,
    TrailerHeaderAlmostDone,
}

/// Outcome of one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// Chunk payload inside the slice passed to [`ChunkState::decode`].
    Chunk(Span),
    /// Input exhausted; the hint says how many more bytes are worth waiting for.
    NeedMore(i64),
    /// Terminal chunk and trailer section fully consumed.
    Done,
    /// Malformed framing. Sticky.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Done,
    Invalid,
}

#[derive(Debug, Default)]
struct TrailerCollector {
    line: Vec<u8>,
    fields: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Resumable chunked-body decoder state for one message.
#[derive(Debug)]
pub struct ChunkState {
    phase: ChunkPhase,
    /// Bytes still owed for the current chunk body.
    size: i64,
    /// How many more bytes the caller should wait for before re-invoking.
    length: i64,
    digits: usize,
    terminal: Option<Terminal>,
    trailers: Option<TrailerCollector>,
}

impl Default for ChunkState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkState {
    /// Decoder that scans and discards trailer fields.
    pub fn new() -> Self {
        Self {
            phase: ChunkPhase::Start,
            size: 0,
            length: 3,
            digits: 0,
            terminal: None,
            trailers: None,
        }
    }

    /// Decoder that keeps trailer fields, validated with the header-line scanner.
    pub fn keeping_trailers() -> Self {
        Self {
            trailers: Some(TrailerCollector::default()),
            ..Self::new()
        }
    }

    /// Reset for the next message on the same connection.
    pub fn reset(&mut self) {
        let keep = self.trailers.is_some();
        *self = if keep { Self::keeping_trailers() } else { Self::new() };
    }

    pub fn phase(&self) -> ChunkPhase {
        self.phase
    }

    /// Bytes still owed for the chunk currently being read.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Read-size hint for the next call.
    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn is_done(&self) -> bool {
        self.terminal == Some(Terminal::Done)
    }

    pub fn is_invalid(&self) -> bool {
        self.terminal == Some(Terminal::Invalid)
    }

    /// Trailer fields as `(lowercase name, value)`; empty unless kept.
    pub fn trailers(&self) -> &[(Vec<u8>, Vec<u8>)] {
        self.trailers.as_ref().map(|t| t.fields.as_slice()).unwrap_or(&[])
    }

    /// Consume bytes from `buf` until a payload span, the end of the
    /// message, an error, or the end of input.
    pub fn decode(&mut self, buf: &[u8]) -> Progress<DecodeResult> {
        match self.terminal {
            Some(Terminal::Done) => return Progress::new(0, DecodeResult::Done),
            Some(Terminal::Invalid) => return Progress::new(0, DecodeResult::Invalid),
            None => {}
        }

        let mut pos = 0;
        while pos < buf.len() {
            if self.phase == ChunkPhase::Data {
                let available = buf.len() - pos;
                let take = available.min(usize::try_from(self.size).unwrap_or(usize::MAX));
                self.size -= take as i64;
                if self.size == 0 {
                    self.phase = ChunkPhase::AfterData;
                }
                self.update_hint();
                return match Span::new(pos, take, buf.len()) {
                    Some(span) => Progress::new(pos + take, DecodeResult::Chunk(span)),
                    None => self.fail(pos),
                };
            }

            let ch = buf[pos];
            pos += 1;
            if !self.step(ch) {
                return self.fail(pos);
            }
            if self.terminal == Some(Terminal::Done) {
                self.length = 0;
                return Progress::new(pos, DecodeResult::Done);
            }
        }

        self.update_hint();
        Progress::new(pos, DecodeResult::NeedMore(self.length))
    }

    fn fail(&mut self, consumed: usize) -> Progress<DecodeResult> {
        self.terminal = Some(Terminal::Invalid);
        Progress::new(consumed, DecodeResult::Invalid)
    }

    /// Advance over one framing byte. Returns `false` on a grammar violation.
    fn step(&mut self, ch: u8) -> bool {
        use ChunkPhase::*;

        match self.phase {
            Start => match hex_value(ch) {
                Some(d) => {
                    self.size = i64::from(d);
                    self.digits = 1;
                    self.phase = Size;
                }
                None => return false,
            },
            Size => {
                if let Some(d) = hex_value(ch) {
                    if self.digits == MAX_CHUNK_SIZE_DIGITS {
                        return false;
                    }
                    self.size = self.size * 16 + i64::from(d);
                    self.digits += 1;
                    return true;
                }
                self.phase = match (ch, self.size == 0) {
                    (b'\r', _) => ExtensionAlmostDone,
                    (b'\n', true) => Trailer,
                    (b'\n', false) => Data,
                    (b';' | b' ' | b'\t', true) => LastChunkExtension,
                    (b';' | b' ' | b'\t', false) => Extension,
                    _ => return false,
                };
            }
            Extension => match ch {
                b'\r' => self.phase = ExtensionAlmostDone,
                b'\n' => self.phase = Data,
                _ => {}
            },
            LastChunkExtension => match ch {
                b'\r' => self.phase = ExtensionAlmostDone,
                b'\n' => self.phase = Trailer,
                _ => {}
            },
            ExtensionAlmostDone => {
                if ch != b'\n' {
                    return false;
                }
                self.phase = if self.size == 0 { Trailer } else { Data };
            }
            Data => unreachable!("chunk payload is consumed in bulk"),
            AfterData => match ch {
                b'\r' => self.phase = AfterDataAlmostDone,
                b'\n' => self.phase = Start,
                _ => return false,
            },
            AfterDataAlmostDone => {
                if ch != b'\n' {
                    return false;
                }
                self.phase = Start;
            }
            Trailer => match ch {
                b'\r' => self.phase = TrailerAlmostDone,
                b'\n' => self.terminal = Some(Terminal::Done),
                _ => {
                    self.phase = TrailerHeader;
                    return self.keep_trailer_byte(ch);
                }
            },
            TrailerAlmostDone => {
                if ch != b'\n' {
                    return false;
                }
                self.terminal = Some(Terminal::Done);
            }
            TrailerHeader => {
                match ch {
                    b'\r' => self.phase = TrailerHeaderAlmostDone,
                    b'\n' => self.phase = Trailer,
                    _ => {}
                }
                if !self.keep_trailer_byte(ch) {
                    return false;
                }
                if ch == b'\n' {
                    return self.finish_trailer_line();
                }
            }
            TrailerHeaderAlmostDone => {
                if ch != b'\n' {
                    return false;
                }
                self.phase = Trailer;
                if !self.keep_trailer_byte(ch) {
                    return false;
                }
                return self.finish_trailer_line();
            }
        }
        true
    }

    fn keep_trailer_byte(&mut self, ch: u8) -> bool {
        match self.trailers.as_mut() {
            Some(collector) if collector.line.len() >= MAX_TRAILER_LINE => false,
            Some(collector) => {
                collector.line.push(ch);
                true
            }
            None => true,
        }
    }

    fn finish_trailer_line(&mut self) -> bool {
        let Some(collector) = self.trailers.as_mut() else {
            return true;
        };
        let line = std::mem::take(&mut collector.line);
        let mut scanner = ResponseHeadParser::for_headers();
        match scanner.parse_header_line(&line) {
            HeaderParse::Header(header) => {
                let value = header.value.slice(&line).unwrap_or_default().to_vec();
                collector.fields.push((header.lowcase_name().to_vec(), value));
                true
            }
            HeaderParse::HeadersDone | HeaderParse::Again | HeaderParse::Error => false,
        }
    }

    fn update_hint(&mut self) {
        use ChunkPhase::*;

        self.length = match self.phase {
            // "0" LF LF
            Start => 3,
            // LF, then either the payload plus LF "0" LF LF or a final LF
            Size => 1 + if self.size > 0 { self.size + 4 } else { 1 },
            Extension | ExtensionAlmostDone => 1 + self.size + 4,
            Data => self.size + 4,
            AfterData | AfterDataAlmostDone => 4,
            LastChunkExtension => 2,
            Trailer | TrailerAlmostDone => 1,
            TrailerHeader | TrailerHeaderAlmostDone => 2,
        };
    }
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// Chunked encoder for the outbound request body.
///
/// The CRLF closing a chunk is emitted lazily, in front of the next chunk
/// header or the terminator, so payload buffers pass through untouched.
#[derive(Debug, Default)]
pub struct ChunkedEncoder {
    emitted: bool,
    finished: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether at least one data chunk has been framed.
    pub fn has_emitted(&self) -> bool {
        self.emitted
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Framing that must precede a payload of `len` bytes. Empty for `len == 0`.
    pub fn chunk_header(&mut self, len: usize) -> Bytes {
        if len == 0 || self.finished {
            return Bytes::new();
        }
        let mut header = BytesMut::with_capacity(20);
        if self.emitted {
            header.put_slice(b"\r\n");
        }
        header.put_slice(format!("{:x}\r\n", len).as_bytes());
        self.emitted = true;
        header.freeze()
    }

    /// Terminator for the body. A body with no data chunks gets the short form.
    pub fn finish(&mut self) -> Bytes {
        if self.finished {
            return Bytes::new();
        }
        self.finished = true;
        if self.emitted {
            Bytes::from_static(b"\r\n0\r\n\r\n")
        } else {
            Bytes::from_static(b"0\r\n\r\n")
        }
    }

    /// Append one framed chunk to `dst`.
    pub fn encode(&mut self, data: &[u8], dst: &mut BytesMut) {
        let header = self.chunk_header(data.len());
        dst.put_slice(&header);
        if !header.is_empty() {
            dst.put_slice(data);
        }
    }
}

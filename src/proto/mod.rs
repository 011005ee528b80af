//! HTTP/1.x wire protocol primitives used on the upstream side.
//!
//! # Data Flow
//! ```text
//! Outbound (client → upstream):
//!     request body bytes
//!     → framing.rs (BodyEncoder: Fixed byte budget | chunked.rs encoder)
//!     → upstream socket
//!
//! Inbound (upstream → client):
//!     upstream socket
//!     → head.rs (status line, header lines)
//!     → framing.rs (BodyDecoder: Fixed | chunked.rs decoder | UntilClose)
//!     → gateway::pump
//! ```
//!
//! # Design Decisions
//! - Sans-IO: every parser takes byte slices and returns explicit result
//!   variants; nothing here touches a socket
//! - Resumable: state lives in small structs so a message can be fed one byte
//!   at a time and produce the same output as one large read
//! - Positions are reported as [`Span`]s into the caller's buffer, never as
//!   copies

pub mod chunked;
pub mod framing;
pub mod head;

pub use chunked::{ChunkPhase, ChunkState, ChunkedEncoder, DecodeResult, MAX_CHUNK_SIZE_DIGITS};
pub use framing::{BodyDecoder, BodyEncoder, BodyEvent, FrameLength, FramingError};
pub use head::{HeaderLine, HeaderParse, HttpVersion, KnownHeader, ResponseHeadParser, StatusLine, StatusParse};

use std::ops::Range;

/// A validated `(start, len)` window into a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    start: usize,
    len: usize,
}

impl Span {
    /// Create a span, rejecting windows that do not fit in `bound` bytes.
    pub fn new(start: usize, len: usize, bound: usize) -> Option<Self> {
        let end = start.checked_add(len)?;
        (end <= bound).then_some(Self { start, len })
    }

    /// Span covering `start..end` of a buffer of `bound` bytes.
    pub fn from_range(range: Range<usize>, bound: usize) -> Option<Self> {
        let len = range.end.checked_sub(range.start)?;
        Self::new(range.start, len, bound)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }

    /// Shift the span right by `offset` bytes.
    pub fn offset(self, offset: usize) -> Self {
        Self {
            start: self.start + offset,
            len: self.len,
        }
    }

    /// Bytes covered by the span, or `None` if `buf` is shorter than the span.
    pub fn slice<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        buf.get(self.range())
    }
}

/// Result of one step of a resumable parser: how many input bytes were
/// consumed and what was recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress<T> {
    pub consumed: usize,
    pub result: T,
}

impl<T> Progress<T> {
    pub fn new(consumed: usize, result: T) -> Self {
        Self { consumed, result }
    }
}

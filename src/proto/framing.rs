//! Body framing for both directions.
//!
//! # Responsibilities
//! - Decide how a message body ends (`FrameLength`)
//! - Decode inbound bodies into payload spans (`BodyDecoder`)
//! - Frame outbound bodies and enforce declared lengths (`BodyEncoder`)
//!
//! # Design Decisions
//! - A direction is closed for data once `Fixed(0)` or the chunked
//!   terminator is reached; trailing bytes are reported as `Overflow`,
//!   never silently delivered
//! - Length bookkeeping uses `i64` like the wire values it mirrors

use bytes::Bytes;
use thiserror::Error;

use crate::proto::chunked::{ChunkState, ChunkedEncoder, DecodeResult};
use crate::proto::{Progress, Span};

/// How the end of a message body is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    /// Exactly this many bytes follow the head.
    Fixed(i64),
    /// Chunked transfer coding.
    Chunked,
    /// The body ends when the peer closes the connection.
    UntilClose,
}

impl FrameLength {
    /// Framing of a response, given what the head declared.
    ///
    /// Responses to HEAD and 1xx/204/304 responses never carry a body,
    /// whatever their headers say.
    pub fn for_response(status: u16, head_request: bool, content_length: Option<i64>, chunked: bool) -> Self {
        if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
            return FrameLength::Fixed(0);
        }
        if chunked {
            return FrameLength::Chunked;
        }
        match content_length {
            Some(n) => FrameLength::Fixed(n),
            None => FrameLength::UntilClose,
        }
    }

    /// True when no body bytes may follow.
    pub fn is_empty(&self) -> bool {
        matches!(self, FrameLength::Fixed(0))
    }

    /// Known length, if any.
    pub fn fixed(&self) -> Option<i64> {
        match self {
            FrameLength::Fixed(n) => Some(*n),
            _ => None,
        }
    }
}

/// Framing violations, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("invalid chunked body")]
    InvalidChunked,

    #[error("body exceeds declared length by {extra} bytes")]
    Overflow { extra: u64 },

    #[error("connection closed with {remaining} body bytes outstanding")]
    Truncated { remaining: i64 },

    #[error("connection closed inside chunked body")]
    UnterminatedChunked,

    #[error("close-delimited framing is not valid for request bodies")]
    CloseDelimitedRequest,
}

/// Events produced while decoding a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEvent {
    /// Payload bytes inside the slice passed to [`BodyDecoder::decode`].
    Data(Span),
    /// Input exhausted. Hint is the number of bytes worth waiting for (0 if unknown).
    NeedMore(i64),
    /// The body is complete.
    Done,
    /// Bytes past the end of the body; they were consumed and must be discarded.
    Overflow(usize),
    /// Malformed chunked framing.
    Invalid,
}

/// Inbound body decoder.
#[derive(Debug)]
pub struct BodyDecoder {
    frame: FrameLength,
    remaining: i64,
    chunk: ChunkState,
    eof: bool,
}

impl BodyDecoder {
    pub fn new(frame: FrameLength) -> Self {
        let remaining = frame.fixed().unwrap_or(0);
        Self {
            frame,
            remaining,
            chunk: ChunkState::new(),
            eof: false,
        }
    }

    pub fn frame(&self) -> FrameLength {
        self.frame
    }

    /// Bytes still expected for `Fixed` framing.
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn chunk_state(&self) -> &ChunkState {
        &self.chunk
    }

    /// Whether the body ended by its own framing (or by close, for `UntilClose`).
    pub fn is_done(&self) -> bool {
        match self.frame {
            FrameLength::Fixed(_) => self.remaining == 0,
            FrameLength::Chunked => self.chunk.is_done(),
            FrameLength::UntilClose => self.eof,
        }
    }

    /// Decode the next event out of `buf`.
    pub fn decode(&mut self, buf: &[u8]) -> Progress<BodyEvent> {
        match self.frame {
            FrameLength::Fixed(_) => self.decode_fixed(buf),
            FrameLength::Chunked => self.decode_chunked(buf),
            FrameLength::UntilClose => {
                if buf.is_empty() {
                    return Progress::new(0, BodyEvent::NeedMore(0));
                }
                Progress::new(buf.len(), BodyEvent::Data(Span::new(0, buf.len(), buf.len()).unwrap_or_default()))
            }
        }
    }

    fn decode_fixed(&mut self, buf: &[u8]) -> Progress<BodyEvent> {
        if self.remaining == 0 {
            return if buf.is_empty() {
                Progress::new(0, BodyEvent::Done)
            } else {
                Progress::new(buf.len(), BodyEvent::Overflow(buf.len()))
            };
        }
        if buf.is_empty() {
            return Progress::new(0, BodyEvent::NeedMore(self.remaining));
        }
        let take = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        self.remaining -= take as i64;
        Progress::new(take, BodyEvent::Data(Span::new(0, take, buf.len()).unwrap_or_default()))
    }

    fn decode_chunked(&mut self, buf: &[u8]) -> Progress<BodyEvent> {
        if self.chunk.is_done() {
            return if buf.is_empty() {
                Progress::new(0, BodyEvent::Done)
            } else {
                Progress::new(buf.len(), BodyEvent::Overflow(buf.len()))
            };
        }
        let step = self.chunk.decode(buf);
        let event = match step.result {
            DecodeResult::Chunk(span) => BodyEvent::Data(span),
            DecodeResult::NeedMore(hint) => BodyEvent::NeedMore(hint),
            DecodeResult::Done => BodyEvent::Done,
            DecodeResult::Invalid => BodyEvent::Invalid,
        };
        Progress::new(step.consumed, event)
    }

    /// The peer closed the connection. Only close-delimited bodies may end this way.
    pub fn finish_eof(&mut self) -> Result<(), FramingError> {
        self.eof = true;
        match self.frame {
            FrameLength::UntilClose => Ok(()),
            FrameLength::Fixed(_) if self.remaining == 0 => Ok(()),
            FrameLength::Fixed(_) => Err(FramingError::Truncated {
                remaining: self.remaining,
            }),
            FrameLength::Chunked if self.chunk.is_done() => Ok(()),
            FrameLength::Chunked => Err(FramingError::UnterminatedChunked),
        }
    }
}

/// Outbound (request) body framer.
#[derive(Debug)]
pub enum BodyEncoder {
    Fixed { remaining: i64 },
    Chunked(ChunkedEncoder),
}

impl BodyEncoder {
    pub fn new(frame: FrameLength) -> Result<Self, FramingError> {
        match frame {
            FrameLength::Fixed(n) => Ok(BodyEncoder::Fixed { remaining: n }),
            FrameLength::Chunked => Ok(BodyEncoder::Chunked(ChunkedEncoder::new())),
            FrameLength::UntilClose => Err(FramingError::CloseDelimitedRequest),
        }
    }

    /// Frame `data`, appending wire buffers to `out`. The payload itself is
    /// pushed as-is.
    pub fn encode(&mut self, data: Bytes, out: &mut Vec<Bytes>) -> Result<(), FramingError> {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            BodyEncoder::Fixed { remaining } => {
                let len = data.len() as i64;
                if len > *remaining {
                    return Err(FramingError::Overflow {
                        extra: (len - *remaining) as u64,
                    });
                }
                *remaining -= len;
                out.push(data);
            }
            BodyEncoder::Chunked(encoder) => {
                out.push(encoder.chunk_header(data.len()));
                out.push(data);
            }
        }
        Ok(())
    }

    /// End of the outbound body.
    pub fn finish(&mut self, out: &mut Vec<Bytes>) -> Result<(), FramingError> {
        match self {
            BodyEncoder::Fixed { remaining } if *remaining > 0 => Err(FramingError::Truncated {
                remaining: *remaining,
            }),
            BodyEncoder::Fixed { .. } => Ok(()),
            BodyEncoder::Chunked(encoder) => {
                out.push(encoder.finish());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut BodyDecoder, input: &[u8]) -> (Vec<u8>, BodyEvent) {
        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            let step = decoder.decode(&input[pos..]);
            match step.result {
                BodyEvent::Data(span) => out.extend_from_slice(span.offset(pos).slice(input).unwrap()),
                other => return (out, other),
            }
            pos += step.consumed;
        }
    }

    #[test]
    fn test_response_framing_rules() {
        assert_eq!(FrameLength::for_response(304, false, Some(0), false), FrameLength::Fixed(0));
        assert_eq!(FrameLength::for_response(204, false, None, true), FrameLength::Fixed(0));
        assert_eq!(FrameLength::for_response(200, true, Some(10), false), FrameLength::Fixed(0));
        assert_eq!(FrameLength::for_response(200, false, Some(10), false), FrameLength::Fixed(10));
        assert_eq!(FrameLength::for_response(200, false, None, true), FrameLength::Chunked);
        assert_eq!(FrameLength::for_response(200, false, None, false), FrameLength::UntilClose);
    }

    #[test]
    fn test_fixed_counts_and_overflows() {
        let mut decoder = BodyDecoder::new(FrameLength::Fixed(5));
        let (out, event) = drain(&mut decoder, b"hello world");
        assert_eq!(out, b"hello");
        assert_eq!(event, BodyEvent::Overflow(6));
        assert!(decoder.is_done());
    }

    #[test]
    fn test_fixed_need_more_then_done() {
        let mut decoder = BodyDecoder::new(FrameLength::Fixed(4));
        let (out, event) = drain(&mut decoder, b"ab");
        assert_eq!(out, b"ab");
        assert_eq!(event, BodyEvent::NeedMore(2));
        let (out, event) = drain(&mut decoder, b"cd");
        assert_eq!(out, b"cd");
        assert_eq!(event, BodyEvent::Done);
    }

    #[test]
    fn test_fixed_truncated_on_eof() {
        let mut decoder = BodyDecoder::new(FrameLength::Fixed(4));
        let _ = drain(&mut decoder, b"ab");
        assert_eq!(decoder.finish_eof(), Err(FramingError::Truncated { remaining: 2 }));
    }

    #[test]
    fn test_chunked_data_after_terminator() {
        let mut decoder = BodyDecoder::new(FrameLength::Chunked);
        let (out, event) = drain(&mut decoder, b"1\r\na\r\n0\r\n\r\n");
        assert_eq!(out, b"a");
        assert_eq!(event, BodyEvent::Done);
        assert_eq!(decoder.decode(b"junk").result, BodyEvent::Overflow(4));
    }

    #[test]
    fn test_until_close() {
        let mut decoder = BodyDecoder::new(FrameLength::UntilClose);
        let (out, event) = drain(&mut decoder, b"anything");
        assert_eq!(out, b"anything");
        assert_eq!(event, BodyEvent::NeedMore(0));
        assert!(!decoder.is_done());
        assert!(decoder.finish_eof().is_ok());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_encoder_fixed_budget() {
        let mut encoder = BodyEncoder::new(FrameLength::Fixed(3)).unwrap();
        let mut out = Vec::new();
        encoder.encode(Bytes::from_static(b"ab"), &mut out).unwrap();
        assert_eq!(
            encoder.encode(Bytes::from_static(b"cd"), &mut out),
            Err(FramingError::Overflow { extra: 1 })
        );
        assert_eq!(encoder.finish(&mut out), Err(FramingError::Truncated { remaining: 1 }));
    }

    #[test]
    fn test_encoder_chunked_passes_payload_through() {
        let mut encoder = BodyEncoder::new(FrameLength::Chunked).unwrap();
        let payload = Bytes::from_static(b"xyz");
        let mut out = Vec::new();
        encoder.encode(payload.clone(), &mut out).unwrap();
        encoder.finish(&mut out).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].as_ptr(), payload.as_ptr());
        assert_eq!(out.concat(), b"3\r\nxyz\r\n0\r\n\r\n");
    }

    #[test]
    fn test_close_delimited_request_rejected() {
        assert!(BodyEncoder::new(FrameLength::UntilClose).is_err());
    }
}

//! Response body transfer.
//!
//! # Data Flow
//! ```text
//! upstream read (Bytes)
//!     → BodyDecoder (Fixed | Chunked | UntilClose)
//!     → Unbuffered: payload spans sliced out of the read buffer (no copy)
//!       Buffered:   payload copied into the BufferPool; when the pool is
//!                   exhausted the caller is asked to flush (write or spill)
//!     → next_output() → downstream writer
//! ```
//!
//! # Design Decisions
//! - Bytes past the declared end are discarded with a warning and make the
//!   upstream connection ineligible for reuse; the response still succeeds
//! - Invalid chunked framing abandons the response as an upstream failure
//! - The pump never blocks; it reports what it needs and returns

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

use crate::gateway::buffer::BufferPool;
use crate::gateway::error::GatewayError;
use crate::observability::metrics;
use crate::proto::{BodyDecoder, BodyEvent, FrameLength, FramingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// Copy through the buffer pool ("pipe" mode).
    Buffered,
    /// Forward slices of the read buffers directly.
    Unbuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// Input consumed; more upstream bytes are needed.
    NeedMore,
    /// The pool is exhausted. Drain output, then call `feed` again with
    /// `input.slice(consumed..)`.
    FlushRequested { consumed: usize },
    /// The body is complete.
    Done,
}

#[derive(Debug)]
pub struct TransferPump {
    decoder: BodyDecoder,
    mode: PumpMode,
    pool: BufferPool,
    current: Option<bytes::BytesMut>,
    /// Decoded payload not yet stored because the pool was exhausted.
    pending: Bytes,
    output: VecDeque<Bytes>,
    keepalive: bool,
    forwarded: u64,
    discarded: u64,
}

impl TransferPump {
    pub fn new(frame: FrameLength, mode: PumpMode, pool: BufferPool, keepalive: bool) -> Self {
        Self {
            decoder: BodyDecoder::new(frame),
            mode,
            pool,
            current: None,
            pending: Bytes::new(),
            output: VecDeque::new(),
            keepalive,
            forwarded: 0,
            discarded: 0,
        }
    }

    pub fn mode(&self) -> PumpMode {
        self.mode
    }

    pub fn is_done(&self) -> bool {
        self.decoder.is_done() && self.pending.is_empty()
    }

    /// The upstream connection may be reused: the body ended by its own
    /// framing and nothing extra arrived.
    pub fn keepalive(&self) -> bool {
        self.keepalive && self.decoder.is_done() && self.decoder.frame() != FrameLength::UntilClose
    }

    /// Payload bytes accepted for the client.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Bytes dropped past the declared end of the body.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Feed bytes read from the upstream.
    pub fn feed(&mut self, input: &Bytes) -> Result<PumpStatus, GatewayError> {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            if !self.store(pending) {
                return Ok(PumpStatus::FlushRequested { consumed: 0 });
            }
        }

        let mut pos = 0;
        loop {
            let step = self.decoder.decode(&input[pos..]);
            let at = pos;
            pos += step.consumed;

            match step.result {
                BodyEvent::Data(span) => {
                    let data = input.slice(span.offset(at).range());
                    self.forwarded += data.len() as u64;
                    match self.mode {
                        PumpMode::Unbuffered => self.output.push_back(data),
                        PumpMode::Buffered => {
                            if !self.store(data) {
                                return Ok(PumpStatus::FlushRequested { consumed: pos });
                            }
                        }
                    }
                }
                BodyEvent::NeedMore(_) => return Ok(PumpStatus::NeedMore),
                BodyEvent::Done => {
                    if pos < input.len() {
                        continue;
                    }
                    self.flush_partial();
                    return Ok(PumpStatus::Done);
                }
                BodyEvent::Overflow(extra) => {
                    self.discard(extra);
                }
                BodyEvent::Invalid => {
                    metrics::record_framing_violation("invalid_chunked");
                    return Err(GatewayError::upstream_framing(FramingError::InvalidChunked));
                }
            }
        }
    }

    /// The upstream closed the connection.
    pub fn finish_eof(&mut self) -> Result<(), GatewayError> {
        self.keepalive = false;
        self.decoder.finish_eof().map_err(|e| {
            metrics::record_framing_violation("truncated");
            GatewayError::upstream_framing(e)
        })?;
        self.flush_partial();
        Ok(())
    }

    fn discard(&mut self, extra: usize) {
        self.discarded += extra as u64;
        if self.keepalive || self.discarded == extra as u64 {
            tracing::warn!(
                extra_bytes = extra,
                frame = ?self.decoder.frame(),
                "Upstream sent more data than declared, discarding"
            );
            metrics::record_framing_violation("overflow");
        }
        self.keepalive = false;
    }

    /// Copy `data` into pool buffers. Returns false (keeping the rest as
    /// pending) when the pool is exhausted.
    fn store(&mut self, mut data: Bytes) -> bool {
        let size = self.pool.buffer_size();
        while !data.is_empty() {
            let mut buf = match self.current.take() {
                Some(buf) => buf,
                None => match self.pool.acquire() {
                    Some(buf) => buf,
                    None => {
                        self.pending = data;
                        return false;
                    }
                },
            };
            let n = (size - buf.len()).min(data.len());
            buf.extend_from_slice(&data[..n]);
            data.advance(n);
            if buf.len() >= size {
                self.pool.push_busy(buf);
            } else {
                self.current = Some(buf);
            }
        }
        true
    }

    /// Move a partially filled buffer to the busy list so it can be written.
    pub fn flush_partial(&mut self) {
        if let Some(buf) = self.current.take() {
            self.pool.push_busy(buf);
        }
    }

    /// Next buffer for the downstream writer, oldest first.
    pub fn next_output(&mut self) -> Option<Bytes> {
        self.output.pop_front().or_else(|| self.pool.pop_busy())
    }

    /// Busy pool buffers, for spilling to a temporary file.
    pub fn take_busy(&mut self) -> Vec<Bytes> {
        self.pool.take_busy()
    }

    /// Bytes held in busy pool buffers.
    pub fn busy_bytes(&self) -> usize {
        self.pool.busy_bytes()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty() || self.pool.busy_len() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(pump: &mut TransferPump) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(buf) = pump.next_output() {
            out.extend_from_slice(&buf);
        }
        out
    }

    fn unbuffered(frame: FrameLength) -> TransferPump {
        TransferPump::new(frame, PumpMode::Unbuffered, BufferPool::new(16, 4), true)
    }

    #[test]
    fn test_empty_body_transfers_nothing() {
        let mut pump = unbuffered(FrameLength::Fixed(0));
        assert_eq!(pump.feed(&Bytes::new()).unwrap(), PumpStatus::Done);
        assert!(pump.next_output().is_none());
        assert!(pump.keepalive());
    }

    #[test]
    fn test_chunked_wikipedia() {
        let mut pump = unbuffered(FrameLength::Chunked);
        let input = Bytes::from_static(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        assert_eq!(pump.feed(&input).unwrap(), PumpStatus::Done);
        assert_eq!(drain(&mut pump), b"Wikipedia");
        assert!(pump.is_done());
        assert!(pump.keepalive());
    }

    #[test]
    fn test_overflow_is_discarded_not_fatal() {
        let mut pump = unbuffered(FrameLength::Fixed(100));
        let input = Bytes::from(vec![b'x'; 110]);
        assert_eq!(pump.feed(&input).unwrap(), PumpStatus::Done);
        assert_eq!(drain(&mut pump).len(), 100);
        assert_eq!(pump.forwarded(), 100);
        assert_eq!(pump.discarded(), 10);
        assert!(!pump.keepalive());
    }

    #[test]
    fn test_unbuffered_is_zero_copy() {
        let mut pump = unbuffered(FrameLength::Fixed(5));
        let input = Bytes::from_static(b"hello");
        pump.feed(&input).unwrap();
        let out = pump.next_output().unwrap();
        assert_eq!(out.as_ptr(), input.as_ptr());
    }

    #[test]
    fn test_invalid_chunked_is_upstream_error() {
        let mut pump = unbuffered(FrameLength::Chunked);
        let err = pump.feed(&Bytes::from_static(b"zz\r\n")).unwrap_err();
        assert_eq!(err.status(), 502);
        assert!(err.failure_kind().is_some());
    }

    #[test]
    fn test_buffered_flush_requested_and_resumed() {
        let body: Vec<u8> = (0..100u8).collect();
        let mut pump = TransferPump::new(FrameLength::Fixed(100), PumpMode::Buffered, BufferPool::new(10, 3), true);
        let input = Bytes::from(body.clone());

        let mut out = Vec::new();
        let mut rest = input.clone();
        let mut flushes = 0;
        loop {
            match pump.feed(&rest).unwrap() {
                PumpStatus::FlushRequested { consumed } => {
                    flushes += 1;
                    out.extend(drain(&mut pump));
                    rest = rest.slice(consumed..);
                }
                PumpStatus::Done => break,
                PumpStatus::NeedMore => panic!("body was complete"),
            }
        }
        out.extend(drain(&mut pump));
        assert!(flushes > 0);
        assert_eq!(out, body);
        assert!(pump.keepalive());
    }

    #[test]
    fn test_buffered_partial_flush() {
        let mut pump = TransferPump::new(FrameLength::UntilClose, PumpMode::Buffered, BufferPool::new(64, 2), true);
        assert_eq!(pump.feed(&Bytes::from_static(b"abc")).unwrap(), PumpStatus::NeedMore);
        assert!(!pump.has_output());
        pump.flush_partial();
        assert_eq!(drain(&mut pump), b"abc");

        pump.feed(&Bytes::from_static(b"def")).unwrap();
        pump.finish_eof().unwrap();
        assert_eq!(drain(&mut pump), b"def");
        assert!(!pump.keepalive());
    }

    #[test]
    fn test_truncated_body_fails_on_eof() {
        let mut pump = unbuffered(FrameLength::Fixed(10));
        pump.feed(&Bytes::from_static(b"short")).unwrap();
        assert!(pump.finish_eof().is_err());
    }

    #[test]
    fn test_split_feeds_match_single_feed() {
        let wire = b"3\r\nabc\r\n10;ext=1\r\n0123456789abcdef\r\n0\r\nX-T: 1\r\n\r\n";
        let mut whole = unbuffered(FrameLength::Chunked);
        whole.feed(&Bytes::from_static(wire)).unwrap();
        let expected = drain(&mut whole);

        for _ in 0..50 {
            let mut pump = unbuffered(FrameLength::Chunked);
            let mut pos = 0;
            let mut last = PumpStatus::NeedMore;
            while pos < wire.len() {
                let n = fastrand::usize(1..=(wire.len() - pos));
                last = pump.feed(&Bytes::copy_from_slice(&wire[pos..pos + n])).unwrap();
                pos += n;
            }
            assert_eq!(last, PumpStatus::Done);
            assert_eq!(drain(&mut pump), expected);
        }
    }
}

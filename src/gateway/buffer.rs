//! Per-request buffer pool for pipe mode.
//!
//! Buffers rotate between a free list and a busy list. A filled buffer is
//! frozen into `Bytes` and queued as busy; its `BytesMut` handle goes back on
//! the free list and reclaims the same allocation once the busy `Bytes` has
//! been written out and dropped.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    limit: usize,
    free: Vec<BytesMut>,
    busy: VecDeque<Bytes>,
}

impl BufferPool {
    /// Pool of `limit` busy buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, limit: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            limit: limit.max(1),
            free: Vec::new(),
            busy: VecDeque::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// No more buffers may be filled until busy ones are drained.
    pub fn is_exhausted(&self) -> bool {
        self.busy.len() >= self.limit
    }

    /// An empty buffer with room for `buffer_size` bytes.
    pub fn acquire(&mut self) -> Option<BytesMut> {
        if self.is_exhausted() {
            return None;
        }
        let mut buf = self.free.pop().unwrap_or_default();
        buf.reserve(self.buffer_size);
        Some(buf)
    }

    /// Queue the filled part of `buf` as busy and recycle its handle.
    pub fn push_busy(&mut self, mut buf: BytesMut) {
        let filled = buf.split().freeze();
        if !filled.is_empty() {
            tracing::trace!(bytes = filled.len(), busy = self.busy.len() + 1, "Buffer filled");
            self.busy.push_back(filled);
        }
        self.free.push(buf);
    }

    /// Oldest busy buffer.
    pub fn pop_busy(&mut self) -> Option<Bytes> {
        self.busy.pop_front()
    }

    /// All busy buffers, oldest first.
    pub fn take_busy(&mut self) -> Vec<Bytes> {
        self.busy.drain(..).collect()
    }

    pub fn busy_len(&self) -> usize {
        self.busy.len()
    }

    pub fn busy_bytes(&self) -> usize {
        self.busy.iter().map(Bytes::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_drain() {
        let mut pool = BufferPool::new(4, 2);
        for _ in 0..2 {
            let mut buf = pool.acquire().unwrap();
            buf.extend_from_slice(b"abcd");
            pool.push_busy(buf);
        }
        assert!(pool.is_exhausted());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.busy_bytes(), 8);

        assert_eq!(pool.pop_busy().unwrap(), Bytes::from_static(b"abcd"));
        assert!(pool.acquire().is_some());
        assert_eq!(pool.take_busy().len(), 1);
        assert_eq!(pool.busy_len(), 0);
    }

    #[test]
    fn test_storage_is_reused_after_write() {
        let mut pool = BufferPool::new(8, 1);
        let mut buf = pool.acquire().unwrap();
        buf.extend_from_slice(b"12345678");
        let first = buf.as_ptr();
        pool.push_busy(buf);

        drop(pool.pop_busy());
        let again = pool.acquire().unwrap();
        assert_eq!(again.as_ptr(), first);
        assert!(again.capacity() >= 8);
    }

    #[test]
    fn test_empty_buffers_are_not_queued() {
        let mut pool = BufferPool::new(8, 1);
        let buf = pool.acquire().unwrap();
        pool.push_busy(buf);
        assert_eq!(pool.busy_len(), 0);
    }
}

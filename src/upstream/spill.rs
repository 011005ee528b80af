//! Temporary-file spill for pipe mode.
//!
//! When the client reads slower than the upstream writes and every pool
//! buffer is busy, busy buffers are appended to an anonymous temporary file
//! and later read back in order. Everything in the file is older than any
//! buffer still in memory.

use std::io::{self, SeekFrom};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::observability::metrics;

#[derive(Debug)]
pub struct SpillFile {
    /// Keeps the file alive; it is removed on drop.
    _file: NamedTempFile,
    writer: File,
    reader: File,
    written: u64,
    read: u64,
    limit: u64,
}

impl SpillFile {
    /// Create a spill file in `dir` (the system temp dir when `None`) that
    /// accepts at most `limit` bytes in total.
    pub fn create(dir: Option<&Path>, limit: u64) -> io::Result<Self> {
        let file = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        let writer = File::from_std(file.reopen()?);
        let reader = File::from_std(file.reopen()?);
        tracing::debug!(path = %file.path().display(), limit, "Created spill file");
        Ok(Self {
            _file: file,
            writer,
            reader,
            written: 0,
            read: 0,
            limit,
        })
    }

    /// Whether `len` more bytes fit under the limit.
    pub fn has_room(&self, len: u64) -> bool {
        self.written + len <= self.limit
    }

    /// Bytes written but not yet read back.
    pub fn pending(&self) -> u64 {
        self.written - self.read
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append buffers, oldest first.
    pub async fn write(&mut self, bufs: &[Bytes]) -> io::Result<()> {
        let mut total = 0u64;
        for buf in bufs {
            self.writer.write_all(buf).await?;
            total += buf.len() as u64;
        }
        self.writer.flush().await?;
        self.written += total;
        metrics::record_temp_file_bytes(total);
        tracing::trace!(bytes = total, pending = self.pending(), "Spilled busy buffers");
        Ok(())
    }

    /// Read back up to `max` of the oldest unread bytes.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        let want = self.pending().min(max as u64) as usize;
        if want == 0 {
            return Ok(None);
        }
        self.reader.seek(SeekFrom::Start(self.read)).await?;
        let mut buf = BytesMut::zeroed(want);
        self.reader.read_exact(&mut buf).await?;
        self.read += want as u64;
        Ok(Some(buf.freeze()))
    }
}

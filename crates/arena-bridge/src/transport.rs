//! Transport abstractions for the simulation bridge
//!
//! Provides RecordReader/RecordWriter traits over newline-delimited records, and
//! line-framed implementations for any tokio byte stream.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::protocol::MAX_LINE_BYTES;

/// Framing-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record of {len} bytes exceeds limit of {max}")]
    RecordTooLarge { len: usize, max: usize },

    #[error("Stream ended mid-record")]
    Truncated,
}

/// Trait for async reading from a transport
#[async_trait]
pub trait RecordReader: Send {
    /// Read the next record without its newline. `None` on clean end of stream.
    async fn read_record(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Trait for async writing to a transport
#[async_trait]
pub trait RecordWriter: Send {
    /// Write one record followed by a newline, and flush
    async fn write_record(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Shut the write side down
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// Newline-framed reader with a record size limit
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_LINE_BYTES)
    }

    pub fn with_limit(inner: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max_len,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RecordReader for LineReader<R> {
    async fn read_record(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            self.buf.clear();
            // One byte of headroom for the newline
            let limit = self.max_len as u64 + 1;
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }

            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
            } else if self.buf.len() > self.max_len {
                return Err(TransportError::RecordTooLarge {
                    len: self.buf.len(),
                    max: self.max_len,
                });
            } else {
                return Err(TransportError::Truncated);
            }

            // Blank keep-alive lines carry nothing
            if !self.buf.is_empty() {
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
        }
    }
}

/// Newline-framed writer
#[derive(Debug)]
pub struct LineWriter<W> {
    inner: W,
    max_len: usize,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_limit(inner, MAX_LINE_BYTES)
    }

    pub fn with_limit(inner: W, max_len: usize) -> Self {
        Self { inner, max_len }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RecordWriter for LineWriter<W> {
    async fn write_record(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.max_len {
            return Err(TransportError::RecordTooLarge {
                len: data.len(),
                max: self.max_len,
            });
        }
        let mut line = Vec::with_capacity(data.len() + 1);
        line.extend_from_slice(data);
        line.push(b'\n');

        self.inner.write_all(&line).await?;
        // Flush to ensure data is sent
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

//! Line and payload framing over a raw byte stream.

use std::time::Duration;

use linkdeploy_protocol::constants::MAX_LINE_LEN;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::LINK_BUFFER_SIZE;
use crate::error::LinkError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One end of the deploy link.
///
/// The link is exclusively owned by one session at a time; both reads and
/// writes go through `&mut self`.
pub struct Link {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    /// Bytes of a line that has not seen its newline yet. Kept across
    /// timeouts so a slow sender never loses a partial header.
    line_buf: Vec<u8>,
}

impl Link {
    /// Wraps a bidirectional stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::with_capacity(LINK_BUFFER_SIZE, Box::new(reader)),
            writer: Box::new(writer),
            line_buf: Vec::new(),
        }
    }

    /// Waits for the next line without a deadline.
    ///
    /// Returns `None` once the peer has closed the stream and no partial
    /// line is pending.
    pub async fn recv_line(&mut self) -> Result<Option<String>, LinkError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line_buf.is_empty() {
                    return Ok(None);
                }
                let raw = std::mem::take(&mut self.line_buf);
                return Ok(Some(decode_line(&raw)));
            }

            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                self.line_buf.extend_from_slice(&available[..pos]);
                self.reader.consume(pos + 1);
                if self.line_buf.len() > MAX_LINE_LEN {
                    self.line_buf.clear();
                    return Err(LinkError::LineTooLong(MAX_LINE_LEN));
                }
                let raw = std::mem::take(&mut self.line_buf);
                let line = decode_line(&raw);
                trace!(%line, "line received");
                return Ok(Some(line));
            }

            let n = available.len();
            self.line_buf.extend_from_slice(available);
            self.reader.consume(n);

            if self.line_buf.len() > MAX_LINE_LEN {
                self.line_buf.clear();
                return Err(LinkError::LineTooLong(MAX_LINE_LEN));
            }
        }
    }

    /// Waits at most `timeout` for the next line.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        tokio::time::timeout(timeout, self.recv_line())
            .await
            .map_err(|_| LinkError::Timeout)?
    }

    /// Reads whatever payload bytes are available, waiting at most `timeout`.
    ///
    /// Returns 0 when the peer has closed the stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        if !self.line_buf.is_empty() {
            // A payload never follows an unterminated line; hand back what we hold.
            let n = self.line_buf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.line_buf[..n]);
            self.line_buf.drain(..n);
            return Ok(n);
        }

        tokio::time::timeout(timeout, self.reader.read(buf))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(LinkError::from)
    }

    /// Reads exactly `len` payload bytes.
    ///
    /// `stall_timeout` bounds the wait for each next chunk, not the whole
    /// payload, so large payloads over slow links do not time out while
    /// bytes keep arriving.
    pub async fn read_exact_bytes(
        &mut self,
        len: usize,
        stall_timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.read_chunk(&mut out[filled..], stall_timeout).await?;
            if n == 0 {
                return Err(LinkError::Closed);
            }
            filled += n;
        }
        Ok(out)
    }

    /// Writes `line` followed by a newline and flushes.
    pub async fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        trace!(%line, "line sent");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes raw payload bytes (no flush).
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.writer.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), LinkError> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Drops buffered input plus anything that arrives within `settle`.
    ///
    /// Returns the number of bytes discarded.
    pub async fn discard_pending(&mut self, settle: Duration) -> Result<usize, LinkError> {
        let mut discarded = self.line_buf.len();
        self.line_buf.clear();

        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        discarded += buffered;

        let mut scratch = [0u8; 4096];
        loop {
            match tokio::time::timeout(settle, self.reader.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        if discarded > 0 {
            debug!(bytes = discarded, "discarded stale input");
        }
        Ok(discarded)
    }
}

/// Decodes a raw line lossily and strips a trailing carriage return.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

//! Newline-delimited framing.
//!
//! Lines on the wire are raw bytes terminated by a single `\n`. There is no
//! length prefix and no escaping. Inbound lines are delivered with the
//! delimiter and any trailing ASCII whitespace (including `\r`) removed;
//! outbound lines get exactly one `\n` appended.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Line delimiter.
pub const DELIMITER: u8 = b'\n';

/// Default upper bound on a single inbound line (excluding the delimiter).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 8 * 1024;

/// Errors produced while reading a line.
#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("line exceeds {limit} bytes")]
    TooLong { limit: usize },
}

/// Buffered line reader over any async byte source.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_line_length: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wrap `reader`, rejecting lines longer than `max_line_length` bytes.
    pub fn new(reader: R, max_line_length: usize) -> Self {
        Self {
            inner: BufReader::with_capacity(BUFFER_SIZE, reader),
            max_line_length,
        }
    }

    /// Read the next line.
    ///
    /// Returns `Ok(None)` when the stream is at EOF and nothing was read.
    /// A final line without a delimiter is still returned. The returned
    /// bytes are right-trimmed and may be empty (a blank line).
    pub async fn read_line(&mut self) -> Result<Option<Bytes>, LineError> {
        let mut line = BytesMut::new();
        let mut saw_any = false;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            saw_any = true;

            match available.iter().position(|&b| b == DELIMITER) {
                Some(pos) => {
                    if line.len() + pos > self.max_line_length {
                        return Err(LineError::TooLong {
                            limit: self.max_line_length,
                        });
                    }
                    line.extend_from_slice(&available[..pos]);
                    self.inner.consume(pos + 1);
                    break;
                }
                None => {
                    let n = available.len();
                    if line.len() + n > self.max_line_length {
                        return Err(LineError::TooLong {
                            limit: self.max_line_length,
                        });
                    }
                    line.extend_from_slice(available);
                    self.inner.consume(n);
                }
            }
        }

        if !saw_any {
            return Ok(None);
        }

        let end = trimmed_len(&line);
        line.truncate(end);
        Ok(Some(line.freeze()))
    }
}

/// Length of `line` once trailing ASCII whitespace is removed.
pub fn trimmed_len(line: &[u8]) -> usize {
    line.iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1)
}

/// Frame `line` for the wire by appending the delimiter.
pub fn encode_line(line: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(line.len() + 1);
    frame.extend_from_slice(line);
    frame.put_u8(DELIMITER);
    frame
}

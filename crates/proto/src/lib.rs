//! llmpipe wire protocol
//!
//! Length-prefixed framing used between a host process and a worker over the
//! worker's stdin/stdout. Every message is a 4-byte little-endian `u32` length
//! followed by exactly that many payload bytes. The only unframed bytes on the
//! wire are the single handshake line the worker prints once it is ready.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

/// Size of the length prefix in front of every frame
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Handshake line printed by a worker that is ready for requests
pub const DEFAULT_HANDSHAKE: &str = "READY";

/// Prefix of a framed response that reports a failed request
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Default upper bound on a single payload
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

// Payload buffers start small and grow with the bytes that actually arrive.
const INITIAL_PAYLOAD_CAPACITY: usize = 8 * 1024;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    /// Declared payload length is above the configured limit
    #[error("frame of {declared} bytes exceeds limit of {limit} bytes")]
    TooLarge { declared: u32, limit: u32 },

    /// Payload cannot be described by a u32 prefix
    #[error("payload of {0} bytes does not fit a u32 length prefix")]
    PayloadTooLong(usize),

    /// Peer sent something other than the expected handshake line
    #[error("unexpected handshake line: {0:?}")]
    Handshake(String),

    /// Underlying transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for framing operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// A decoded worker response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Generated text for a successful request
    Text(String),

    /// Reason attached to an `ERROR: ` response
    Error(String),
}

impl Response {
    /// Classify a response payload
    pub fn parse(payload: Vec<u8>) -> Self {
        let text = match String::from_utf8(payload) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        };

        match text.strip_prefix(ERROR_PREFIX) {
            Some(reason) => Response::Error(reason.to_string()),
            None => Response::Text(text),
        }
    }
}

/// Encode a payload as a complete frame
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLong(payload.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads length-prefixed messages from an async byte stream
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: u32,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a reader with the default payload limit
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Override the payload limit
    pub fn with_max_frame_bytes(mut self, limit: u32) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the stream closes before a complete frame has
    /// arrived, whether that happens before the prefix or inside the payload.
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        if !read_full(&mut self.inner, &mut prefix).await? {
            return Ok(None);
        }

        let declared = u32::from_le_bytes(prefix);
        if declared > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                declared,
                limit: self.max_frame_bytes,
            });
        }

        let mut payload = Vec::with_capacity((declared as usize).min(INITIAL_PAYLOAD_CAPACITY));
        let received = (&mut self.inner)
            .take(u64::from(declared))
            .read_to_end(&mut payload)
            .await?;

        if received < declared as usize {
            warn!(
                "Stream closed inside a frame: declared {} bytes, received {}",
                declared, received
            );
            return Ok(None);
        }

        trace!("Read frame of {} bytes", declared);
        Ok(Some(payload))
    }
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Wait for the worker's handshake line.
    ///
    /// Must be called before the first `read_message`, since the handshake
    /// is the only unframed text on the stream.
    pub async fn read_handshake(&mut self, expected: &str) -> Result<()> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line).await?;
        if n == 0 {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before handshake",
            )));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line != expected {
            return Err(FrameError::Handshake(line.to_string()));
        }
        Ok(())
    }
}

/// Writes length-prefixed messages to an async byte stream
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a new writer
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Consume the writer, returning the underlying stream
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write one message and flush it.
    ///
    /// A short write is reported as an error and never retried.
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;

        trace!("Wrote frame of {} bytes", payload.len());
        Ok(())
    }

    /// Write an `ERROR: <reason>` message
    pub async fn write_error(&mut self, reason: &str) -> Result<()> {
        let message = format!("{}{}", ERROR_PREFIX, reason);
        self.write_message(message.as_bytes()).await
    }

    /// Write the unframed handshake line
    pub async fn write_handshake(&mut self, line: &str) -> Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Fill `buf` completely. Returns `false` if the stream ends first.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled > 0 {
                warn!("Stream closed inside a length prefix after {} bytes", filled);
            }
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

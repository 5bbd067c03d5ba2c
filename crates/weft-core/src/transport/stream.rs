use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::TransportError;
use crate::message::Envelope;

use super::Transport;

/// Maximum varint length in bytes.
const MAX_VARINT_LEN: usize = 10;

/// Default maximum frame size (16 MB).
const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a u64 value as a varint into a buffer.
/// Returns the number of bytes written.
fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return i + 1;
        } else {
            buf[i] = byte | 0x80;
            i += 1;
        }
    }
}

/// Result of reading a varint from a stream.
enum VarintResult {
    /// Successfully read a varint value.
    Value(u64),
    /// Stream ended cleanly before any varint bytes were read.
    /// This represents a graceful connection close.
    CleanEof,
    /// Stream ended after reading some varint bytes but before termination.
    TruncatedVarint,
    /// Varint exceeded 10 bytes without terminating.
    TooLong,
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<VarintResult, std::io::Error> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for bytes_read in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Distinguish clean close from truncated varint
                if bytes_read == 0 {
                    return Ok(VarintResult::CleanEof);
                } else {
                    return Ok(VarintResult::TruncatedVarint);
                }
            }
            Err(e) => return Err(e),
        }

        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(VarintResult::Value(value));
        }
        shift += 7;
    }

    // 10 bytes read and the continuation bit is still set
    Ok(VarintResult::TooLong)
}

/// Length-prefixed JSON framing over any byte stream.
///
/// Each envelope travels as a varint byte length followed by its JSON body.
/// Movables are carried inline; a byte stream has nothing to move them
/// through.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    max_frame_size: AtomicUsize,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Create a transport from separate reader and writer streams.
    ///
    /// This is useful when you have separate read and write handles,
    /// such as stdin/stdout or split TCP connections.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                max_frame_size: AtomicUsize::new(DEFAULT_MAX_FRAME_SIZE),
            }),
        }
    }

    /// Create a transport from stdin and stdout.
    ///
    /// This is how a child process run under the `proc` transport talks
    /// back to its parent.
    pub fn from_stdio() -> Self {
        Self::from_split(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    /// Set the maximum frame size for this transport.
    pub fn set_max_frame_size(&self, size: usize) {
        self.inner.max_frame_size.store(size, Ordering::Release);
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Transport for StreamTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let body =
            serde_json::to_vec(&envelope).map_err(|e| TransportError::Encode(e.to_string()))?;
        let max_frame_size = self.inner.max_frame_size.load(Ordering::Acquire);
        if body.len() > max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max: max_frame_size,
            });
        }

        let mut varint_buf = [0u8; MAX_VARINT_LEN];
        let varint_len = encode_varint(body.len() as u64, &mut varint_buf);

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&varint_buf[..varint_len]).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;

        let body_len = match read_varint(&mut *reader).await {
            Ok(VarintResult::Value(len)) => len as usize,
            Ok(VarintResult::CleanEof) => {
                // Clean close - no bytes read before EOF
                return Err(TransportError::Closed);
            }
            Ok(VarintResult::TruncatedVarint) => {
                return Err(TransportError::Decode(
                    "stream ended before varint length prefix terminated".to_string(),
                ));
            }
            Ok(VarintResult::TooLong) => {
                return Err(TransportError::Decode(
                    "varint length prefix exceeded 10 bytes".to_string(),
                ));
            }
            Err(e) => return Err(TransportError::Io(e)),
        };

        let max_frame_size = self.inner.max_frame_size.load(Ordering::Acquire);
        if body_len > max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: body_len,
                max: max_frame_size,
            });
        }

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

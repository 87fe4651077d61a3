//! Framed JSON transport over the control socket.
//!
//! The wire protocol carries newline-terminated JSON documents with no
//! length prefix, so framing is discovered by incremental trial-parsing:
//! bytes accumulate in a receive buffer until the front of the buffer
//! parses as one complete top-level document. A single message may arrive
//! over many chunks, and one chunk may carry more than one message.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::config::Endpoint;
use crate::error::{Error, Result};

/// Maximum bytes buffered while waiting for a complete document (4 MiB).
/// Safety valve against a peer that streams unparseable data forever.
const MAX_BUFFERED: usize = 4 * 1024 * 1024;

/// Read chunk size. One logical message rarely fits a single chunk.
const READ_CHUNK: usize = 4096;

/// Owns one streaming connection and reassembles its bytes into JSON
/// documents. Generic over the stream so tests can drive it with mock
/// and in-memory transports.
#[derive(Debug)]
pub struct FramedTransport<S> {
    stream: S,
    buf: Vec<u8>,
    closed: bool,
}

impl FramedTransport<TcpStream> {
    /// Open a TCP connection to the control endpoint.
    pub async fn open(endpoint: &Endpoint) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        // Control traffic is small request/response pairs; don't batch them.
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            closed: false,
        }
    }

    /// Read one complete JSON document, accumulating chunks as needed.
    ///
    /// Fails with [`Error::TruncatedStream`] if the peer closes before a
    /// complete document is seen. There is no internal timeout; bounding
    /// the wait is the caller's policy.
    pub async fn read_message(&mut self) -> Result<Value> {
        loop {
            if let Some(value) = self.take_buffered()? {
                return Ok(value);
            }
            if self.closed {
                return Err(Error::TruncatedStream {
                    buffered: self.buf.len(),
                });
            }
            if self.buf.len() > MAX_BUFFERED {
                return Err(Error::Protocol(format!(
                    "receive buffer exceeded {MAX_BUFFERED} bytes without a complete message"
                )));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                self.closed = true;
                return Err(Error::TruncatedStream {
                    buffered: self.buf.len(),
                });
            }
            trace!(bytes = n, buffered = self.buf.len(), "Read chunk");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Serialize `value` and write it as one newline-terminated document.
    pub async fn write_message<T: Serialize>(&mut self, value: &T) -> Result<()> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        let mut payload = serde_json::to_vec(value)
            .map_err(|e| Error::Protocol(format!("unserializable message: {e}")))?;
        payload.push(b'\n');
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Release the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }

    /// Try to parse one complete document off the front of the buffer.
    ///
    /// Returns `Ok(None)` when the buffered bytes are a prefix of a valid
    /// document (more data needed); anything unparseable is a protocol
    /// error, not a framing wait.
    fn take_buffered(&mut self) -> Result<Option<Value>> {
        let (next, consumed) = {
            let mut documents = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            (documents.next(), documents.byte_offset())
        };
        match next {
            None => Ok(None),
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(Error::Protocol(format!("unparseable data on stream: {e}"))),
        }
    }
}

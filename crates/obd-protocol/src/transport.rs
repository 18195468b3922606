//! Byte-Stream Transport
//!
//! Shared handle over the adapter's read and write halves. The handle never
//! opens or closes the underlying stream; it only reads and writes it.

use crate::error::ObdError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::trace;

/// Upper bound for writing one command line
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Cloneable handle over an adapter byte stream
#[derive(Clone)]
pub struct Transport {
    reader: Arc<Mutex<BufReader<BoxedReader>>>,
    writer: Arc<Mutex<BoxedWriter>>,
}

impl Transport {
    /// Create a transport from separate read and write halves
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            reader: Arc::new(Mutex::new(BufReader::new(reader))),
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Create a transport from a bidirectional stream (serial port, socket, duplex pipe)
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Write `bytes` followed by the end-of-line byte and flush
    pub async fn write_command(&self, bytes: &[u8], end_of_line: u8) -> Result<(), ObdError> {
        let mut line = Vec::with_capacity(bytes.len() + 1);
        line.extend_from_slice(bytes);
        line.push(end_of_line);

        trace!("-> {}", String::from_utf8_lossy(bytes));
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(WRITE_TIMEOUT, async {
            writer.write_all(&line).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| {
            ObdError::Transport(format!(
                "write did not complete within {}ms",
                WRITE_TIMEOUT.as_millis()
            ))
        })??;
        Ok(())
    }

    /// Read a single byte; end of stream is a transport failure
    pub async fn read_byte(&self) -> Result<u8, ObdError> {
        let mut reader = self.reader.lock().await;
        match reader.read_u8().await {
            Ok(byte) => Ok(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ObdError::Transport("stream closed".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read whatever is available into `buf`; end of stream is a transport failure
    pub async fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, ObdError> {
        let mut reader = self.reader.lock().await;
        let read = reader.read(buf).await?;
        if read == 0 && !buf.is_empty() {
            return Err(ObdError::Transport("stream closed".to_string()));
        }
        Ok(read)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_appends_end_of_line() {
        let (local, mut remote) = tokio::io::duplex(64);
        let transport = Transport::from_stream(local);

        transport.write_command(b"01 0D", b'\r').await.unwrap();

        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"01 0D\r");
    }

    #[tokio::test]
    async fn test_read_bytes_and_eof() {
        let (local, mut remote) = tokio::io::duplex(64);
        let transport = Transport::from_stream(local);

        remote.write_all(b"OK").await.unwrap();
        drop(remote);

        assert_eq!(transport.read_byte().await.unwrap(), b'O');
        let mut buf = [0u8; 8];
        assert_eq!(transport.read_chunk(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], b'K');
        assert!(transport.read_byte().await.unwrap_err().is_transport());
    }
}

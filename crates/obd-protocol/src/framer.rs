//! Response Framer
//!
//! Splits the inbound byte stream into frames on a terminator byte, dropping
//! adapter-noise characters. The line buffer has a fixed capacity. Bytes past
//! it are discarded and the frame is reported as [`ObdError::FrameOverflow`]
//! once its terminator arrives, after which framing resumes cleanly.

use crate::error::ObdError;
use crate::transport::Transport;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Line buffer used by request/response connectors
pub const SEQUENTIAL_FRAME_CAPACITY: usize = 272;

/// Line buffer used by the background response reader
pub const ASYNCHRONOUS_FRAME_CAPACITY: usize = 64;

/// Incremental frame splitter
#[derive(Debug, Clone)]
pub struct ResponseFramer {
    capacity: usize,
    terminator: u8,
    ignored: Vec<u8>,
    buf: Vec<u8>,
    overflowed: bool,
}

impl ResponseFramer {
    /// Create a framer with a fixed line buffer
    pub fn new(capacity: usize, terminator: u8, ignored: &[u8]) -> Self {
        Self {
            capacity,
            terminator,
            ignored: ignored.to_vec(),
            buf: Vec::with_capacity(capacity),
            overflowed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes accumulated for the frame in progress
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Drop the frame in progress
    pub fn reset(&mut self) {
        self.buf.clear();
        self.overflowed = false;
    }

    /// Feed one byte; returns a frame when `byte` is the terminator
    pub fn push(&mut self, byte: u8) -> Option<Result<Vec<u8>, ObdError>> {
        if byte == self.terminator {
            let frame = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
            if std::mem::take(&mut self.overflowed) {
                return Some(Err(ObdError::FrameOverflow {
                    capacity: self.capacity,
                }));
            }
            return Some(Ok(frame));
        }

        if self.ignored.contains(&byte) {
            return None;
        }

        if self.buf.len() >= self.capacity {
            if !self.overflowed {
                warn!(
                    "Response exceeded {} bytes without terminator, discarding until next frame",
                    self.capacity
                );
            }
            self.overflowed = true;
            return None;
        }

        self.buf.push(byte);
        None
    }

    /// Feed a chunk; returns every frame it completes, in order
    pub fn push_slice(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, ObdError>> {
        bytes.iter().filter_map(|byte| self.push(*byte)).collect()
    }

    /// Read bytes from `transport` until one frame is complete
    ///
    /// Bounded by `deadline`; returns early with [`ObdError::Cancelled`] once
    /// `cancel` fires. A timed-out partial frame is discarded.
    pub async fn read_frame(
        &mut self,
        transport: &Transport,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ObdError> {
        let result = {
            let read = async {
                loop {
                    let byte = transport.read_byte().await?;
                    if let Some(frame) = self.push(byte) {
                        return frame;
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => Err(ObdError::Cancelled),
                result = tokio::time::timeout(deadline, read) => {
                    result.unwrap_or(Err(ObdError::Timeout(deadline.as_millis() as u64)))
                }
            }
        };

        match &result {
            Ok(frame) => debug!("<- {}", String::from_utf8_lossy(frame)),
            Err(ObdError::Timeout(_)) | Err(ObdError::Cancelled) => self.reset(),
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn framer(capacity: usize) -> ResponseFramer {
        ResponseFramer::new(capacity, b'>', b" \r")
    }

    fn frames(framer: &mut ResponseFramer, input: &[u8]) -> Vec<Result<Vec<u8>, ObdError>> {
        framer.push_slice(input)
    }

    #[test]
    fn test_splits_and_strips_ignored_chars() {
        let mut framer = framer(272);
        let out = frames(&mut framer, b"41 0D 55\r\r>NO DATA\r>");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), b"410D55");
        assert_eq!(out[1].as_ref().unwrap(), b"NODATA");
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_empty_frame() {
        let mut framer = framer(16);
        let out = frames(&mut framer, b"\r>");
        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_overflow_truncates_and_resyncs() {
        let mut framer = framer(4);
        let out = frames(&mut framer, b"0123456789>410D>");
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(ObdError::FrameOverflow { capacity: 4 })));
        assert_eq!(out[1].as_ref().unwrap(), b"410D");
    }

    #[test]
    fn test_frame_exactly_at_capacity() {
        let mut framer = framer(4);
        let out = frames(&mut framer, b"410D>");
        assert_eq!(out[0].as_ref().unwrap(), b"410D");
    }

    #[test]
    fn test_partial_frame_survives_between_pushes() {
        let mut framer = framer(64);
        assert!(frames(&mut framer, b"41 0C").is_empty());
        assert_eq!(framer.pending(), b"410C");
        let out = frames(&mut framer, b" 1A F8>");
        assert_eq!(out[0].as_ref().unwrap(), b"410C1AF8");
    }

    #[tokio::test]
    async fn test_read_frame_from_transport() {
        let (local, mut remote) = tokio::io::duplex(64);
        let transport = Transport::from_stream(local);
        let mut framer = framer(SEQUENTIAL_FRAME_CAPACITY);
        let cancel = CancellationToken::new();

        remote.write_all(b"41 0D 2A\r\r>").await.unwrap();
        let frame = framer
            .read_frame(&transport, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(frame, b"410D2A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_frame_times_out_and_discards_partial() {
        let (local, mut remote) = tokio::io::duplex(64);
        let transport = Transport::from_stream(local);
        let mut framer = framer(SEQUENTIAL_FRAME_CAPACITY);
        let cancel = CancellationToken::new();

        remote.write_all(b"41 0D").await.unwrap();
        let err = framer
            .read_frame(&transport, Duration::from_millis(500), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Timeout(500)));
        assert!(framer.pending().is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_cancelled() {
        let (local, _remote) = tokio::io::duplex(64);
        let transport = Transport::from_stream(local);
        let mut framer = framer(SEQUENTIAL_FRAME_CAPACITY);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = framer
            .read_frame(&transport, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Cancelled));
    }
}

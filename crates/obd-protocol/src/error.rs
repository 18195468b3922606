//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur while talking to an OBD-II adapter
#[derive(Debug, Clone, Error)]
pub enum ObdError {
    /// Reading from or writing to the byte stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout waiting for a response frame
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A response frame grew past the line buffer before its terminator arrived
    #[error("Response frame exceeded {capacity} bytes without a terminator")]
    FrameOverflow { capacity: usize },

    /// The adapter answered with a different PID than the one requested
    #[error("Unmatched response, expected type {expected}")]
    UnmatchedResponse { expected: String },

    /// This adapter candidate could not establish a connection
    #[error("Adapter failed: {0}")]
    AdapterFailed(String),

    /// The connection to the ECU was lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No adapter candidate could establish a connection
    #[error("All adapters failed: {0}")]
    AllAdaptersFailed(String),

    /// No measurement arrived within the liveness window
    #[error("No data received for {0}s")]
    NoData(u64),

    /// The looper entered the same phase too often
    #[error("Too often in phase {phase}: {count}")]
    PhaseRepeated { phase: &'static str, count: u32 },

    /// The operation was cancelled by a shutdown
    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl ObdError {
    /// Whether this error stems from the underlying byte stream
    pub fn is_transport(&self) -> bool {
        matches!(self, ObdError::Transport(_))
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

//! OBD-II Protocol Implementation
//!
//! This crate provides the command/response model for ELM327-style OBD-II
//! adapters: PID decoding, response framing over an async byte stream, and
//! an in-process mock adapter.

mod command;
mod error;
mod framer;
pub mod mock;
mod pid;
mod protocol;
mod transport;

pub use command::{
    Command, CommandKind, CommandState, CommandValue, ControlCommand, FuelSystemStatus,
    LambdaReading, END_OF_LINE_RECEIVE, END_OF_LINE_SEND, IGNORED_CHARS, STATUS_OK,
};
pub use error::ObdError;
pub use framer::{ResponseFramer, ASYNCHRONOUS_FRAME_CAPACITY, SEQUENTIAL_FRAME_CAPACITY};
pub use pid::{Pid, DEFAULT_REQUEST_PIDS, LAMBDA_PROBE_COUNT};
pub use protocol::ObdProtocol;
pub use transport::{Transport, WRITE_TIMEOUT};

/// Current Unix time in milliseconds
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

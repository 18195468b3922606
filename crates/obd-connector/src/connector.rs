//! Connector Abstraction
//!
//! A connector carries the adapter-specific policy: device-name matching,
//! the initialization handshake, the per-cycle request set and how command
//! outcomes translate into a [`ConnectionState`].

use async_trait::async_trait;
use obd_protocol::{Command, ObdError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How far a connector got with the adapter during one attempt
///
/// Ordered so that `state >= ConnectionState::Connected` covers both
/// connected and verified adapters.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ConnectionState {
    /// No response understood yet
    #[default]
    Disconnected,
    /// The initialization exchange succeeded
    Connected,
    /// A measurement was parsed successfully
    Verified,
}

/// Session options shared by all connector candidates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorOptions {
    /// Request the PIDs the vehicle reports as supported instead of the default list
    pub use_pid_supported: bool,
    /// Command names that are never blacklisted
    pub whitelisted_commands: Vec<String>,
}

/// Capability set every adapter connector implements
#[async_trait]
pub trait Connector: Send {
    /// Short adapter name for logs and status updates
    fn name(&self) -> &'static str;

    /// Heuristic match against the paired device's advertised name
    fn supports_device(&self, device_name: &str) -> bool;

    fn connection_state(&self) -> ConnectionState;

    /// Start background work such as response readers
    fn start_executions(&mut self) {}

    /// Run the adapter's setup handshake
    ///
    /// Fails with [`ObdError::AdapterFailed`] when this adapter should be
    /// rejected in favour of the next candidate.
    async fn execute_initialization_commands(&mut self) -> Result<(), ObdError>;

    /// Run one measurement cycle and return the commands that finished
    ///
    /// Fails with [`ObdError::ConnectionLost`] when the adapter stopped
    /// answering sensibly, or with a transport error.
    async fn execute_request_commands(&mut self) -> Result<Vec<Command>, ObdError>;

    fn maximum_tries_for_initialization(&self) -> u32;

    fn preferred_request_period(&self) -> Duration;

    /// Token cancelled by [`Connector::shutdown`], usable from any task
    fn shutdown_handle(&self) -> CancellationToken;

    /// Stop background readers ahead of [`Connector::shutdown`]
    fn prepare_shutdown(&self) {}

    /// Release resources and stop in-flight reads; idempotent
    fn shutdown(&self) {
        self.shutdown_handle().cancel();
    }
}

impl std::fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name())
            .field("state", &self.connection_state())
            .finish()
    }
}

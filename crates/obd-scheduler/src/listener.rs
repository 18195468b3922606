//! Looper Listeners
//!
//! Callbacks the looper uses to report measurements and connection changes.
//! Both traits are called from the looper task and the liveness monitor.

use obd_protocol::{Command, ObdError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives decoded measurements
pub trait DataListener: Send + Sync {
    /// A command finished during a measurement cycle
    fn receive_update(&self, command: &Command);

    /// The looper entered the measurement phase for `device_name`
    fn on_connected(&self, device_name: &str);
}

/// Receives connection lifecycle notifications
pub trait ConnectionListener: Send + Sync {
    /// An adapter accepted the initialization exchange
    fn on_connection_verified(&self);

    /// No candidate could connect; the looper has stopped
    fn on_all_adapters_failed(&self);

    /// Informational status text
    fn on_status_update(&self, message: &str);

    /// The looper has stopped; the caller should reopen the transport and
    /// start a new looper
    fn request_connection_retry(&self, reason: &ObdError);
}

/// Everything a looper reports, as a single event type
#[derive(Debug, Clone)]
pub enum LooperEvent {
    Update(Command),
    Connected(String),
    ConnectionVerified,
    AllAdaptersFailed,
    StatusUpdate(String),
    ConnectionRetry(ObdError),
}

impl LooperEvent {
    /// Events after which the looper has stopped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LooperEvent::AllAdaptersFailed | LooperEvent::ConnectionRetry(_)
        )
    }
}

/// Forwards looper callbacks into a bounded channel
///
/// Regular events are dropped while the channel is full. Terminal events
/// wait for room on a separate task.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::Sender<LooperEvent>,
}

impl ChannelListener {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LooperEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, event: LooperEvent) {
        let event = match self.tx.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Looper event receiver is gone");
                return;
            }
            Err(mpsc::error::TrySendError::Full(event)) => event,
        };

        if !event.is_terminal() {
            debug!("Looper event dropped");
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tx = self.tx.clone();
                runtime.spawn(async move {
                    if tx.send(event).await.is_err() {
                        debug!("Looper event receiver is gone");
                    }
                });
            }
            Err(_) => warn!("Event channel full, dropping {:?}", event),
        }
    }
}

impl DataListener for ChannelListener {
    fn receive_update(&self, command: &Command) {
        self.send(LooperEvent::Update(command.clone()));
    }

    fn on_connected(&self, device_name: &str) {
        self.send(LooperEvent::Connected(device_name.to_string()));
    }
}

impl ConnectionListener for ChannelListener {
    fn on_connection_verified(&self) {
        self.send(LooperEvent::ConnectionVerified);
    }

    fn on_all_adapters_failed(&self) {
        self.send(LooperEvent::AllAdaptersFailed);
    }

    fn on_status_update(&self, message: &str) {
        self.send(LooperEvent::StatusUpdate(message.to_string()));
    }

    fn request_connection_retry(&self, reason: &ObdError) {
        self.send(LooperEvent::ConnectionRetry(reason.clone()));
    }
}

//! Liveness Monitor
//!
//! Watchdog started with every measurement phase. When no measurement has
//! been forwarded within the no-data window it tears the session down and
//! asks for a full reconnect.

use crate::listener::ConnectionListener;
use obd_protocol::ObdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time of the last forwarded measurement, shared with the monitor
#[derive(Debug, Clone)]
pub struct SuccessClock {
    epoch: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Default for SuccessClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl SuccessClock {
    /// Record a success now
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::SeqCst);
    }

    /// Time since the last recorded success
    pub fn since_last_success(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Running watchdog task
#[derive(Debug)]
pub struct LiveMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveMonitor {
    /// Spawn a monitor checking every third of `max_no_data_time`
    ///
    /// On expiry it cancels `adapter` (the current connector's shutdown
    /// handle) and `session`, then requests a connection retry. `cancel`
    /// stops the monitor without side effects.
    pub fn start(
        clock: SuccessClock,
        max_no_data_time: Duration,
        adapter: CancellationToken,
        session: CancellationToken,
        listener: Arc<dyn ConnectionListener>,
        cancel: CancellationToken,
    ) -> Self {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let interval = max_no_data_time / 3;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Live monitor stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                if clock.since_last_success() > max_no_data_time {
                    warn!(
                        "No data for more than {}s, requesting reconnect",
                        max_no_data_time.as_secs()
                    );
                    adapter.cancel();
                    session.cancel();
                    listener.request_connection_retry(&ObdError::NoData(max_no_data_time.as_secs()));
                    return;
                }
            }
        });

        Self { cancel, task }
    }

    /// Stop the watchdog; idempotent
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LiveMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

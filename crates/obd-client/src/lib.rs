//! OBD-II Client
//!
//! Host-side driver for the command looper: opens the adapter's serial port
//! (or the in-process mock), logs every measurement and reopens the
//! connection whenever the looper asks for a retry.

use obd_protocol::mock::{MockConfig, MockElm327};
use obd_protocol::{Command, CommandValue, ObdError, Transport};
use obd_scheduler::{ChannelListener, CommandLooper, LooperConfig, LooperEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Serial device name selecting the in-process mock adapter
pub const MOCK_DEVICE: &str = "mock";

/// Looper events buffered between two polls of the session loop
const EVENT_CAPACITY: usize = 1024;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Serial port path, or "mock" for the emulated adapter
    pub serial_device: String,

    /// Serial baud rate
    pub baud_rate: u32,

    /// Adapter name as advertised by the device, used to preselect a connector
    pub device_name: String,

    /// Wait before reopening the port after a retry request (milliseconds)
    pub reconnect_delay_ms: u64,

    /// Consecutive retries without a measurement before giving up
    pub max_reconnects: u32,

    pub looper: LooperConfig,

    /// Emulated adapter behaviour when `serial_device` is "mock"
    pub mock: MockConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            serial_device: MOCK_DEVICE.to_string(),
            baud_rate: 38400,
            device_name: "OBDII".to_string(),
            reconnect_delay_ms: 3000,
            max_reconnects: 5,
            looper: LooperConfig::default(),
            mock: MockConfig::slow_reset(),
        }
    }
}

impl ClientConfig {
    /// Load from an optional file, then `OBD__`-prefixed environment variables
    ///
    /// `OBD__SERIAL_DEVICE=/dev/ttyUSB0` or `OBD__LOOPER__MAX_PHASE_COUNT=3`
    /// override the file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or("obd-client")).required(false))
            .add_source(
                config::Environment::with_prefix("OBD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn is_mock(&self) -> bool {
        self.serial_device == MOCK_DEVICE
    }
}

/// Client failures
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to open serial port: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("No adapter candidate could connect")]
    AllAdaptersFailed,

    #[error("Giving up after {attempts} reconnects, last reason: {reason}")]
    TooManyReconnects { attempts: u32, reason: ObdError },
}

/// Initialize logging
pub fn init_logging() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

/// Open the configured adapter
pub fn open_transport(config: &ClientConfig) -> Result<Transport, ClientError> {
    if config.is_mock() {
        info!("Using the emulated ELM327 adapter");
        return Ok(MockElm327::new(config.mock.clone()).spawn());
    }

    info!(
        "Opening serial port {} at {} baud",
        config.serial_device, config.baud_rate
    );
    let port = tokio_serial::new(&config.serial_device, config.baud_rate).open_native_async()?;
    Ok(Transport::from_stream(port))
}

/// How a single looper session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Shutdown requested by the user
    Stopped,
    AllAdaptersFailed,
    /// The looper asked for the transport to be reopened
    Retry(ObdError),
}

/// Result of one looper session
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Measurements received during the session
    pub measurements: u64,
}

fn describe(command: &Command) -> String {
    match command.value() {
        Some(CommandValue::Numeric(value)) => format!("{:.2}", value),
        Some(CommandValue::Text(text)) => text.clone(),
        Some(CommandValue::FuelSystem(status)) => format!("{:?}", status),
        Some(CommandValue::Lambda(reading)) => {
            format!("probe {} lambda {:.3}", reading.probe, reading.equivalence_ratio)
        }
        Some(CommandValue::PidSet(pids)) => format!("{} PIDs supported", pids.len()),
        Some(CommandValue::Raw(_)) | None => command.raw_text(),
    }
}

/// Run a looper on `transport` until it stops or `shutdown` is cancelled
pub async fn run_session(
    transport: Transport,
    config: &ClientConfig,
    shutdown: &CancellationToken,
) -> SessionReport {
    let (listener, mut events) = ChannelListener::new(EVENT_CAPACITY);
    let listener = Arc::new(listener);
    let handle = CommandLooper::new(
        transport,
        config.device_name.clone(),
        listener.clone(),
        listener,
        config.looper.clone(),
    )
    .start();

    let mut measurements = 0;
    let outcome = loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                handle.stop();
                break SessionOutcome::Stopped;
            }
            event = events.recv() => event,
        };

        match event {
            Some(LooperEvent::Update(command)) => {
                measurements += 1;
                info!("{}: {}", command.name(), describe(&command));
            }
            Some(LooperEvent::Connected(device)) => info!("Receiving data from {}", device),
            Some(LooperEvent::ConnectionVerified) => info!("Connection verified"),
            Some(LooperEvent::StatusUpdate(status)) => info!("Status: {}", status),
            Some(LooperEvent::AllAdaptersFailed) => break SessionOutcome::AllAdaptersFailed,
            Some(LooperEvent::ConnectionRetry(reason)) => break SessionOutcome::Retry(reason),
            None => break SessionOutcome::Stopped,
        }
    };

    handle.join().await;
    SessionReport {
        outcome,
        measurements,
    }
}

/// Keep a session running, reopening the transport on every retry request
pub async fn run(config: ClientConfig, shutdown: CancellationToken) -> Result<(), ClientError> {
    let mut reconnects = 0;
    loop {
        let transport = open_transport(&config)?;
        let report = run_session(transport, &config, &shutdown).await;
        if report.measurements > 0 {
            reconnects = 0;
        }

        match report.outcome {
            SessionOutcome::Stopped => {
                info!("Session stopped");
                return Ok(());
            }
            SessionOutcome::AllAdaptersFailed => return Err(ClientError::AllAdaptersFailed),
            SessionOutcome::Retry(reason) => {
                if reconnects >= config.max_reconnects {
                    return Err(ClientError::TooManyReconnects {
                        attempts: reconnects,
                        reason,
                    });
                }
                reconnects += 1;
                warn!(
                    "Reconnecting in {}ms ({}/{}): {}",
                    config.reconnect_delay_ms, reconnects, config.max_reconnects, reason
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(config.reconnect_delay()) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::Pid;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.is_mock());
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.max_reconnects, 5);
        assert_eq!(config.looper.max_phase_count, 2);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = ClientConfig::load(Some("does-not-exist.toml")).unwrap();
        assert_eq!(config.device_name, "OBDII");
        assert_eq!(config.looper.adapter_try_period_ms, 5000);
    }

    #[test]
    fn test_describe_values() {
        let mut speed = Command::for_pid(Pid::Speed);
        speed.decode(b"410D32");
        assert_eq!(describe(&speed), "50.00");

        let pending = Command::for_pid(Pid::Rpm);
        assert_eq!(describe(&pending), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_logs_measurements_until_stopped() {
        let config = ClientConfig::default();
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            stopper.cancel();
        });

        let transport = open_transport(&config).unwrap();
        let report = run_session(transport, &config, &shutdown).await;
        assert!(matches!(report.outcome, SessionOutcome::Stopped));
        assert!(report.measurements > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_fails_the_client() {
        let config = ClientConfig {
            mock: MockConfig::silent(),
            ..Default::default()
        };
        let err = run(config, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::AllAdaptersFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit() {
        let config = ClientConfig {
            max_reconnects: 0,
            mock: MockConfig {
                hang_up_after: Some(9),
                ..MockConfig::slow_reset()
            },
            ..Default::default()
        };
        let err = run(config, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::TooManyReconnects { attempts: 0, ref reason } if reason.is_transport()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_client_exits_cleanly() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        run(ClientConfig::default(), shutdown).await.unwrap();
    }
}

//! Asynchronous Connector Engine
//!
//! Push-style adapters stream measurements on their own once configured.
//! Commands are only written; every response is framed and parsed by a
//! background [`ResponseReader`] and collected on the next request cycle.

use crate::connector::{ConnectionState, Connector};
use crate::response_reader::{ResponseParser, ResponseReader};
use async_trait::async_trait;
use obd_protocol::{Command, ObdError, Transport};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pause before each initialization command
pub const INITIALIZATION_COMMAND_DELAY: Duration = Duration::from_millis(250);

/// Adapter-specific part of an asynchronous connector
pub trait AsynchronousProfile: Send {
    fn name(&self) -> &'static str;

    fn supports_device(&self, device_name: &str) -> bool;

    fn initialization_commands(&self) -> Vec<Command>;

    /// Commands to write this cycle; may be empty while the adapter streams
    fn request_commands(&mut self) -> Vec<Command>;

    fn connection_state(&self) -> ConnectionState;

    /// Parser for the background reader
    fn response_parser(&self) -> Box<dyn ResponseParser>;

    /// Pause between two request commands
    fn request_command_delay(&self) -> Option<Duration> {
        None
    }

    fn maximum_tries_for_initialization(&self) -> u32;

    fn preferred_request_period(&self) -> Duration;
}

/// Write-only connector whose results come from a [`ResponseReader`]
pub struct AsynchronousConnector<P> {
    profile: P,
    transport: Transport,
    reader: Option<ResponseReader>,
    shutdown: CancellationToken,
}

impl<P: AsynchronousProfile> AsynchronousConnector<P> {
    pub fn new(profile: P, transport: Transport) -> Self {
        Self {
            profile,
            transport,
            reader: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn profile(&self) -> &P {
        &self.profile
    }

    pub fn is_reader_running(&self) -> bool {
        self.reader.as_ref().is_some_and(ResponseReader::is_running)
    }
}

async fn sleep_unless_cancelled(cancel: &CancellationToken, delay: Duration) -> Result<(), ObdError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ObdError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

async fn send(
    transport: &Transport,
    cancel: &CancellationToken,
    command: &Command,
) -> Result<(), ObdError> {
    if let Some(delay) = command.send_delay() {
        sleep_unless_cancelled(cancel, delay).await?;
    }
    debug!("Sending command: {}", command.name());
    transport
        .write_command(command.encode(), command.end_of_line_send())
        .await
}

#[async_trait]
impl<P: AsynchronousProfile> Connector for AsynchronousConnector<P> {
    fn name(&self) -> &'static str {
        self.profile.name()
    }

    fn supports_device(&self, device_name: &str) -> bool {
        self.profile.supports_device(device_name)
    }

    fn connection_state(&self) -> ConnectionState {
        self.profile.connection_state()
    }

    fn start_executions(&mut self) {
        if self.is_reader_running() {
            return;
        }
        self.reader = Some(ResponseReader::start(
            self.transport.clone(),
            self.profile.response_parser(),
            self.shutdown.child_token(),
        ));
    }

    async fn execute_initialization_commands(&mut self) -> Result<(), ObdError> {
        let name = self.profile.name();
        for command in self.profile.initialization_commands() {
            sleep_unless_cancelled(&self.shutdown, INITIALIZATION_COMMAND_DELAY)
                .await
                .map_err(|e| ObdError::AdapterFailed(format!("{}: {}", name, e)))?;
            send(&self.transport, &self.shutdown, &command).await?;
        }
        Ok(())
    }

    async fn execute_request_commands(&mut self) -> Result<Vec<Command>, ObdError> {
        let delay = self.profile.request_command_delay();
        for command in self.profile.request_commands() {
            send(&self.transport, &self.shutdown, &command).await?;
            if let Some(delay) = delay {
                sleep_unless_cancelled(&self.shutdown, delay).await?;
            }
        }

        match &self.reader {
            Some(reader) if reader.is_running() => Ok(reader.pull_available_commands()),
            Some(_) => Err(ObdError::ConnectionLost(
                "Response reader has been shut down".to_string(),
            )),
            None => Ok(Vec::new()),
        }
    }

    fn maximum_tries_for_initialization(&self) -> u32 {
        self.profile.maximum_tries_for_initialization()
    }

    fn preferred_request_period(&self) -> Duration {
        self.profile.preferred_request_period()
    }

    fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn prepare_shutdown(&self) {
        if let Some(reader) = &self.reader {
            reader.shutdown();
        }
    }

    fn shutdown(&self) {
        self.prepare_shutdown();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::Pid;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Echo-style adapter: every frame is a speed reading
    struct Streaming {
        state: ConnectionState,
    }

    struct SpeedParser;

    impl ResponseParser for SpeedParser {
        fn end_of_line(&self) -> u8 {
            b'>'
        }

        fn process_response(&mut self, frame: &[u8]) -> Option<Command> {
            let mut command = Command::for_pid(Pid::Speed);
            command.decode(frame);
            Some(command)
        }
    }

    impl AsynchronousProfile for Streaming {
        fn name(&self) -> &'static str {
            "Streaming"
        }

        fn supports_device(&self, device_name: &str) -> bool {
            device_name == "STREAM"
        }

        fn initialization_commands(&self) -> Vec<Command> {
            vec![Command::raw("Hello", b"hi".to_vec())]
        }

        fn request_commands(&mut self) -> Vec<Command> {
            self.state = ConnectionState::Connected;
            vec![
                Command::raw("Poll", b"p".to_vec()),
                Command::raw("Poll", b"q".to_vec()),
            ]
        }

        fn connection_state(&self) -> ConnectionState {
            self.state
        }

        fn response_parser(&self) -> Box<dyn ResponseParser> {
            Box::new(SpeedParser)
        }

        fn request_command_delay(&self) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }

        fn maximum_tries_for_initialization(&self) -> u32 {
            3
        }

        fn preferred_request_period(&self) -> Duration {
            Duration::from_millis(500)
        }
    }

    fn connector() -> (AsynchronousConnector<Streaming>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        let connector = AsynchronousConnector::new(
            Streaming {
                state: ConnectionState::Disconnected,
            },
            Transport::from_stream(local),
        );
        (connector, remote)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_writes_commands() {
        let (mut connector, mut remote) = connector();
        connector.execute_initialization_commands().await.unwrap();

        let mut written = [0u8; 3];
        remote.read_exact(&mut written).await.unwrap();
        assert_eq!(&written, b"hi\r");
    }

    #[tokio::test]
    async fn test_without_reader_returns_nothing() {
        let (mut connector, mut remote) = connector();
        let commands = connector.execute_request_commands().await.unwrap();
        assert!(commands.is_empty());

        let mut written = [0u8; 4];
        remote.read_exact(&mut written).await.unwrap();
        assert_eq!(&written, b"p\rq\r");
    }

    #[tokio::test]
    async fn test_request_cycle_drains_reader() {
        let (mut connector, mut remote) = connector();
        connector.start_executions();
        connector.start_executions();
        assert!(connector.is_reader_running());

        remote.write_all(b"410D32>410D33>").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let commands = connector.execute_request_commands().await.unwrap();
        let speeds: Vec<f64> = commands.iter().filter_map(|c| c.numeric_value()).collect();
        assert_eq!(speeds, vec![50.0, 51.0]);
        assert_eq!(connector.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stopped_reader_is_connection_lost() {
        let (mut connector, _remote) = connector();
        connector.start_executions();
        connector.prepare_shutdown();

        let err = connector.execute_request_commands().await.unwrap_err();
        assert!(matches!(err, ObdError::ConnectionLost(_)));

        connector.shutdown();
        connector.shutdown();
        assert!(connector.shutdown_handle().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_initialization_fails_adapter() {
        let (mut connector, _remote) = connector();
        connector.shutdown();
        let err = connector.execute_initialization_commands().await.unwrap_err();
        assert!(matches!(err, ObdError::AdapterFailed(_)));
    }
}

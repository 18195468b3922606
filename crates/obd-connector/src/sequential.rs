//! Sequential Connector Engine
//!
//! Request/response adapters (ELM327 family): every command is written and
//! its single response frame read and decoded before the next command goes
//! out. Adapter quirks live in a [`SequentialProfile`].

use crate::blacklist::CommandBlacklist;
use crate::connector::{ConnectionState, Connector, ConnectorOptions};
use async_trait::async_trait;
use obd_protocol::{
    timestamp_ms, Command, CommandKind, CommandState, ObdError, Pid, ResponseFramer, Transport,
    DEFAULT_REQUEST_PIDS, END_OF_LINE_RECEIVE, IGNORED_CHARS, LAMBDA_PROBE_COUNT,
    SEQUENTIAL_FRAME_CAPACITY,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for one response frame
pub const MAX_TIMEOUT: Duration = Duration::from_millis(5000);

/// Upper bound for the whole initialization handshake
pub const INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Unmatched responses tolerated on a stale connection
pub const MAX_INVALID_RESPONSE_COUNT: u32 = 5;

/// Consecutive "SEARCHING" answers tolerated
pub const MAX_SEARCHING_COUNT_IN_A_ROW: u32 = 10;

/// Adapter-specific part of a sequential connector
pub trait SequentialProfile: Send {
    fn name(&self) -> &'static str;

    fn supports_device(&self, device_name: &str) -> bool;

    /// Ordered setup commands; the engine appends the PID-supported query
    fn initialization_commands(&self) -> Vec<Command>;

    /// Score a finished setup command
    fn process_initialization_command(&mut self, command: &Command);

    fn connection_state(&self) -> ConnectionState;

    fn maximum_tries_for_initialization(&self) -> u32 {
        1
    }

    fn preferred_request_period(&self) -> Duration {
        Duration::from_millis(100)
    }
}

/// Request/response connector driven by a [`SequentialProfile`]
pub struct SequentialConnector<P> {
    profile: P,
    transport: Transport,
    framer: ResponseFramer,
    options: ConnectorOptions,
    blacklist: CommandBlacklist,
    read_timeout: Duration,
    connection_established: bool,
    verified: bool,
    stale_connection: bool,
    invalid_response_count: u32,
    searching_count_in_a_row: u32,
    supported_pids: Option<BTreeSet<Pid>>,
    cycle: u64,
    preferred_lambda_probe: Option<Pid>,
    shutdown: CancellationToken,
}

impl<P: SequentialProfile> SequentialConnector<P> {
    pub fn new(profile: P, transport: Transport, options: ConnectorOptions) -> Self {
        let blacklist = CommandBlacklist::new(options.whitelisted_commands.iter().cloned());
        Self {
            profile,
            transport,
            framer: ResponseFramer::new(
                SEQUENTIAL_FRAME_CAPACITY,
                END_OF_LINE_RECEIVE,
                IGNORED_CHARS,
            ),
            options,
            blacklist,
            read_timeout: MAX_TIMEOUT,
            connection_established: false,
            verified: false,
            stale_connection: false,
            invalid_response_count: 0,
            searching_count_in_a_row: 0,
            supported_pids: None,
            cycle: 0,
            preferred_lambda_probe: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the per-frame read bound
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn profile(&self) -> &P {
        &self.profile
    }

    pub fn blacklist(&self) -> &CommandBlacklist {
        &self.blacklist
    }

    /// Supported PIDs adopted from the adapter, if any
    pub fn supported_pids(&self) -> Option<&BTreeSet<Pid>> {
        self.supported_pids.as_ref()
    }

    /// Lambda probe reading locked in after its first successful response
    pub fn preferred_lambda_probe(&self) -> Option<Pid> {
        self.preferred_lambda_probe
    }

    /// Commands for the next cycle
    fn request_commands(&mut self) -> Vec<Command> {
        let mut pids: Vec<Pid> = match &self.supported_pids {
            Some(supported) if !supported.is_empty() => supported.iter().copied().collect(),
            _ => DEFAULT_REQUEST_PIDS.to_vec(),
        };

        match self.preferred_lambda_probe {
            Some(pid) => pids.push(pid),
            None => {
                let probe = (self.cycle % LAMBDA_PROBE_COUNT as u64) as u8 + 1;
                pids.push(Pid::LambdaVoltage(probe));
                pids.push(Pid::LambdaCurrent(probe));
            }
        }

        pids.extend([Pid::FuelSystemStatus, Pid::ShortFuelTrim, Pid::LongFuelTrim]);
        self.cycle += 1;

        let mut seen = BTreeSet::new();
        pids.into_iter()
            .filter(|pid| seen.insert(*pid))
            .map(Command::for_pid)
            .collect()
    }

    async fn read_response_line(&mut self) -> Result<Vec<u8>, ObdError> {
        self.framer
            .read_frame(&self.transport, self.read_timeout, &self.shutdown)
            .await
    }

    /// Write the command and read and decode its response
    async fn run_command(&mut self, command: &mut Command) -> Result<(), ObdError> {
        if let Some(delay) = command.send_delay() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ObdError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(
            "Sending command {} / {}",
            command.name(),
            String::from_utf8_lossy(command.encode())
        );
        self.transport
            .write_command(command.encode(), command.end_of_line_send())
            .await?;

        if !command.awaits_results() {
            return Ok(());
        }

        match self.read_response_line().await {
            Ok(frame) => {
                command.set_result_time(timestamp_ms());
                command.decode(&frame);
            }
            Err(ObdError::Timeout(ms)) if !command.response_required() => {
                debug!("No response for {} within {}ms, not required", command.name(), ms);
                command.set_result_time(timestamp_ms());
                command.decode(&[]);
            }
            Err(e @ (ObdError::Timeout(_) | ObdError::FrameOverflow { .. })) => {
                warn!("Error while reading response for '{}': {}", command.name(), e);
                command.set_state(CommandState::ExecutionError);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Execute one command and classify its outcome
    async fn execute_command(&mut self, command: &mut Command) -> Result<(), ObdError> {
        if command.state() == CommandState::New {
            command.set_state(CommandState::Running);
            if let Err(e) = self.run_command(command).await {
                if e.is_transport() && !self.connection_established {
                    // try a different adapter before giving up on the stream
                    warn!("{}: {}", self.profile.name(), e);
                    return Err(ObdError::AdapterFailed(format!(
                        "{}: {}",
                        self.profile.name(),
                        e
                    )));
                }
                return Err(e);
            }
        }

        if !command.awaits_results() {
            return Ok(());
        }

        match command.state() {
            CommandState::Finished => {
                self.blacklist.record_success(command.name());
                if !self.connection_established {
                    self.on_initialization_command(command);
                    if self.profile.connection_state() >= ConnectionState::Connected {
                        info!("{} connection established", self.profile.name());
                        self.connection_established = true;
                    }
                } else {
                    if matches!(command.kind(), CommandKind::PidSupported { .. }) {
                        self.on_initialization_command(command);
                    }
                    if matches!(command.kind(), CommandKind::Measurement(_)) {
                        self.verified = true;
                    }
                    if self.stale_connection {
                        self.stale_connection = false;
                        self.invalid_response_count = 0;
                        self.searching_count_in_a_row = 0;
                    }
                }
            }
            CommandState::ExecutionError => {
                debug!(
                    "Execution error for {}: {}",
                    command.name(),
                    command.raw_text()
                );
                self.blacklist.record_failure(command.name());
            }
            CommandState::Searching => {
                info!(
                    "Adapter searching. Continuing. Response for {}: {}",
                    command.name(),
                    command.raw_text()
                );
                self.stale_connection = true;

                let count = self.searching_count_in_a_row;
                self.searching_count_in_a_row += 1;
                if count > MAX_SEARCHING_COUNT_IN_A_ROW {
                    return Err(ObdError::ConnectionLost(
                        "Adapter is in SEARCHING mode for too long".to_string(),
                    ));
                }
            }
            CommandState::UnmatchedResult => {
                warn!(
                    "Did not receive the expected result. Expected: {}",
                    command.response_type_id()
                );
                if self.stale_connection {
                    let count = self.invalid_response_count;
                    self.invalid_response_count += 1;
                    if count > MAX_INVALID_RESPONSE_COUNT {
                        return Err(ObdError::ConnectionLost(
                            "Received too many unmatched responses".to_string(),
                        ));
                    }
                }
                self.stale_connection = true;
                return Err(ObdError::UnmatchedResponse {
                    expected: command.response_type_id().to_string(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn on_initialization_command(&mut self, command: &Command) {
        if self.options.use_pid_supported && command.state() != CommandState::ExecutionError {
            if let Some(pids) = command.supported_pids() {
                info!("PID supported result: {:?}", pids);
                self.supported_pids = Some(pids.clone());
            }
        }
        self.profile.process_initialization_command(command);
    }

    /// The first lambda probe reading that finishes becomes the only one polled
    fn evaluate_supported_lambda_command(&mut self, command: &Command) {
        if self.preferred_lambda_probe.is_some() {
            return;
        }
        if let Some(pid) = command.pid().filter(Pid::is_lambda) {
            info!("Using lambda probe {} from now on", pid);
            self.preferred_lambda_probe = Some(pid);
        }
    }

    async fn run_initialization(&mut self) -> Result<(), ObdError> {
        let mut commands = self.profile.initialization_commands();
        commands.push(Command::pid_supported(0));

        for mut command in commands {
            match self.execute_command(&mut command).await {
                Ok(()) => {}
                Err(e @ (ObdError::UnmatchedResponse { .. } | ObdError::ConnectionLost(_))) => {
                    warn!("Unexpected outcome during initialization: {}", e);
                    return Err(ObdError::AdapterFailed(format!(
                        "{}: {}",
                        self.profile.name(),
                        e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<P: SequentialProfile> Connector for SequentialConnector<P> {
    fn name(&self) -> &'static str {
        self.profile.name()
    }

    fn supports_device(&self, device_name: &str) -> bool {
        self.profile.supports_device(device_name)
    }

    fn connection_state(&self) -> ConnectionState {
        let state = self.profile.connection_state();
        if self.verified && state >= ConnectionState::Connected {
            ConnectionState::Verified
        } else {
            state
        }
    }

    async fn execute_initialization_commands(&mut self) -> Result<(), ObdError> {
        let name = self.profile.name();
        if self.shutdown.is_cancelled() {
            return Err(ObdError::AdapterFailed(format!("{} has been shut down", name)));
        }

        let cancel = self.shutdown.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(INITIALIZATION_TIMEOUT, self.run_initialization()) => {
                Some(result)
            }
        };

        // an aborted read leaves part of its reply in the line buffer
        let result = match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                self.framer.reset();
                Err(ObdError::AdapterFailed(format!(
                    "{} initialization took longer than {}s",
                    name,
                    INITIALIZATION_TIMEOUT.as_secs()
                )))
            }
            None => {
                self.framer.reset();
                Err(ObdError::AdapterFailed(format!("{} initialization cancelled", name)))
            }
        };

        match result {
            Err(ObdError::Cancelled) => Err(ObdError::AdapterFailed(format!(
                "{} initialization cancelled",
                name
            ))),
            other => other,
        }
    }

    async fn execute_request_commands(&mut self) -> Result<Vec<Command>, ObdError> {
        if self.shutdown.is_cancelled() {
            return Err(ObdError::Cancelled);
        }

        let mut finished = Vec::new();
        for mut command in self.request_commands() {
            if self.blacklist.is_blacklisted(command.name()) {
                continue;
            }

            match self.execute_command(&mut command).await {
                Ok(()) => {}
                Err(ObdError::UnmatchedResponse { .. }) => {
                    warn!("Unmatched response detected, reading another line");
                    match self.read_response_line().await {
                        Ok(_) | Err(ObdError::Timeout(_)) | Err(ObdError::FrameOverflow { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }

            if command.state() == CommandState::Finished {
                self.evaluate_supported_lambda_command(&command);
                finished.push(command);
            }
        }
        Ok(finished)
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
}

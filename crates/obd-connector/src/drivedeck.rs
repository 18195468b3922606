//! DriveDeck Sport Connector
//!
//! The DriveDeck Sport streams PID values on its own after receiving a cycle
//! command. Frames start with a type character: `B` carries metadata or a
//! PID value, `C` reports the detected vehicle protocol.

use crate::asynchronous::{AsynchronousConnector, AsynchronousProfile};
use crate::connector::ConnectionState;
use crate::response_reader::ResponseParser;
use obd_protocol::{
    timestamp_ms, Command, CommandState, ObdProtocol, Pid, Transport, END_OF_LINE_RECEIVE,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Quiet period after which the cycle command is sent again
pub const SEND_CYCLIC_COMMAND_DELTA: Duration = Duration::from_millis(2500);

/// Settle time before the carriage return that wakes the adapter
pub const INITIALIZATION_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Offset the adapter adds to standard PID codes in the cycle command
pub const CYCLE_PID_OFFSET: u8 = 0x0D;

const CYCLE_COMMAND_PREFIX: &[u8] = b"a17";
const RESPONSE_PREFIX: u8 = b'B';
const PROTOCOL_PREFIX: u8 = b'C';
const TOKEN_SEPARATOR: u8 = b'<';

/// PIDs requested by the cycle command, in order
pub const CYCLE_PIDS: [Pid; 7] = [
    Pid::Speed,
    Pid::Maf,
    Pid::Rpm,
    Pid::IntakeMap,
    Pid::IntakeAirTemp,
    Pid::LambdaVoltage(1),
    Pid::LambdaCurrent(1),
];

/// State shared between the connector and its response parser
#[derive(Debug, Default)]
pub struct DriveDeckStatus {
    pub state: ConnectionState,
    pub vin: Option<String>,
    pub protocol: Option<ObdProtocol>,
    /// Timestamp (ms) of the last accepted PID value
    pub last_result: u64,
    logged_ids: HashSet<String>,
}

impl DriveDeckStatus {
    fn update_connection_state(&mut self) {
        if self.state == ConnectionState::Verified {
            return;
        }
        if self.protocol.is_some() || self.vin.is_some() {
            self.state = ConnectionState::Connected;
        }
    }
}

/// The cycle command: "a17" followed by one offset PID byte per requested value
pub fn cycle_command() -> Command {
    let mut bytes = CYCLE_COMMAND_PREFIX.to_vec();
    bytes.extend(CYCLE_PIDS.iter().map(|pid| pid.code() + CYCLE_PID_OFFSET));
    Command::raw("a17", bytes)
}

/// Standard PID carried by a value frame id
fn pid_for_response_id(id: &str) -> Option<Pid> {
    match id {
        "41" => Some(Pid::Speed),
        "42" => Some(Pid::Maf),
        "52" => Some(Pid::IntakeAirTemp),
        "49" => Some(Pid::IntakeMap),
        "40" | "51" => Some(Pid::Rpm),
        // The adapter does not tell which probe answered
        "4D" => Some(Pid::LambdaVoltage(1)),
        _ => None,
    }
}

/// DriveDeck Sport profile
#[derive(Debug)]
pub struct DriveDeckSport {
    status: Arc<Mutex<DriveDeckStatus>>,
    cycle_command: Command,
}

impl Default for DriveDeckSport {
    fn default() -> Self {
        let cycle_command = cycle_command();
        info!(
            "Static cycle command: {}",
            String::from_utf8_lossy(cycle_command.encode())
        );
        Self {
            status: Arc::new(Mutex::new(DriveDeckStatus::default())),
            cycle_command,
        }
    }
}

impl DriveDeckSport {
    pub fn connector(transport: Transport) -> AsynchronousConnector<Self> {
        AsynchronousConnector::new(Self::default(), transport)
    }

    pub fn vin(&self) -> Option<String> {
        self.status.lock().ok().and_then(|status| status.vin.clone())
    }

    pub fn protocol(&self) -> Option<ObdProtocol> {
        self.status.lock().ok().and_then(|status| status.protocol)
    }

    pub fn last_result(&self) -> u64 {
        self.status
            .lock()
            .map(|status| status.last_result)
            .unwrap_or(0)
    }

    /// Parser sharing this profile's status
    pub fn parser(&self) -> DriveDeckParser {
        DriveDeckParser {
            status: self.status.clone(),
        }
    }
}

impl AsynchronousProfile for DriveDeckSport {
    fn name(&self) -> &'static str {
        "DriveDeck Sport"
    }

    fn supports_device(&self, device_name: &str) -> bool {
        device_name.contains("DRIVEDECK") && device_name.contains("W4")
    }

    fn initialization_commands(&self) -> Vec<Command> {
        vec![Command::raw("Carriage Return", Vec::new())
            .with_send_delay(INITIALIZATION_SETTLE_DELAY)]
    }

    fn request_commands(&mut self) -> Vec<Command> {
        let quiet_for = timestamp_ms().saturating_sub(self.last_result());
        if quiet_for > SEND_CYCLIC_COMMAND_DELTA.as_millis() as u64 {
            vec![self.cycle_command.clone()]
        } else {
            Vec::new()
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.status
            .lock()
            .map(|status| status.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn response_parser(&self) -> Box<dyn ResponseParser> {
        Box::new(self.parser())
    }

    fn maximum_tries_for_initialization(&self) -> u32 {
        15
    }

    fn preferred_request_period(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// Frame parser for the DriveDeck Sport
#[derive(Debug)]
pub struct DriveDeckParser {
    status: Arc<Mutex<DriveDeckStatus>>,
}

impl DriveDeckParser {
    fn process_value(&mut self, id: &str, frame: &[u8]) -> Option<Command> {
        let now = timestamp_ms();
        trace!("Processing PID response: {}", id);

        let mut value = [0u8; 2];
        for (slot, byte) in value
            .iter_mut()
            .zip(frame.iter().skip(4).take_while(|b| **b != TOKEN_SEPARATOR))
        {
            *slot = *byte;
        }

        let mut status = self.status.lock().ok()?;
        if status.logged_ids.insert(id.to_string()) {
            info!("First response for PID {}: {:02X?}", id, value);
        }

        let pid = pid_for_response_id(id)?;
        let mut command = Command::for_pid(pid);
        let mut raw = format!("41{}", pid.tag());
        for byte in value {
            raw.push_str(&format!("{:02X}", byte));
        }

        match command.decode(raw.as_bytes()) {
            CommandState::ExecutionError | CommandState::Searching => return None,
            _ => {}
        }
        command.set_state(CommandState::Finished);
        command.set_result_time(now);
        status.state = ConnectionState::Verified;
        status.last_result = now;
        Some(command)
    }

    fn process_vin(&mut self, vin: String) {
        info!("VIN is: {}", vin);
        if let Ok(mut status) = self.status.lock() {
            status.vin = Some(vin);
            status.update_connection_state();
        }
    }

    fn process_protocol(&mut self, code: &str) {
        let Ok(code) = code.trim().parse::<u8>() else {
            debug!("Invalid protocol code: {}", code);
            return;
        };
        let Some(protocol) = ObdProtocol::from_drivedeck_code(code) else {
            return;
        };

        info!("Protocol is: {:?}", protocol);
        if let Ok(mut status) = self.status.lock() {
            status.protocol = Some(protocol);
            status.update_connection_state();
        }
    }
}

impl ResponseParser for DriveDeckParser {
    fn end_of_line(&self) -> u8 {
        END_OF_LINE_RECEIVE
    }

    fn process_response(&mut self, frame: &[u8]) -> Option<Command> {
        match *frame.first()? {
            RESPONSE_PREFIX => {
                if frame.get(4) == Some(&TOKEN_SEPARATOR) || frame.len() < 3 {
                    return None;
                }
                let id = String::from_utf8_lossy(&frame[1..3]).into_owned();
                let text = || String::from_utf8_lossy(&frame[3..]).into_owned();

                match id.as_str() {
                    "14" => debug!("Status: CONNECTING"),
                    "15" => self.process_vin(text()),
                    // supported PIDs are not evaluated
                    "70" => debug!("Supported PID frame: {}", text()),
                    "71" => info!("Discovered control units: {}", text()),
                    "31" => debug!("Engine: On"),
                    "32" => debug!("Engine: Off"),
                    _ => return self.process_value(&id, frame),
                }
                None
            }
            PROTOCOL_PREFIX => {
                self.process_protocol(&String::from_utf8_lossy(&frame[1..]));
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn parse(profile: &DriveDeckSport, frame: &[u8]) -> Option<Command> {
        profile.parser().process_response(frame)
    }

    #[test]
    fn test_supports_device() {
        let profile = DriveDeckSport::default();
        assert!(profile.supports_device("DRIVEDECK-W4-1234"));
        assert!(!profile.supports_device("DRIVEDECK"));
        assert!(!profile.supports_device("OBDII"));
    }

    #[test]
    fn test_cycle_command_bytes() {
        let command = cycle_command();
        assert_eq!(command.encode(), &[b'a', b'1', b'7', 26, 29, 25, 24, 28, 49, 65]);
        assert!(!command.awaits_results());
    }

    #[test]
    fn test_intake_temperature_frame() {
        let profile = DriveDeckSport::default();
        let command = parse(&profile, b"B52<?0").unwrap();
        assert_eq!(command.pid(), Some(Pid::IntakeAirTemp));
        assert_eq!(command.state(), CommandState::Finished);
        assert_eq!(command.numeric_value(), Some(23.0));
        assert!(command.result_time() > 0);
        assert_eq!(profile.connection_state(), ConnectionState::Verified);
        assert!(profile.last_result() > 0);
    }

    #[test]
    fn test_rpm_frame_ids() {
        let profile = DriveDeckSport::default();
        // 0x0F 0xA0 / 4 = 1000 rpm
        let command = parse(&profile, &[b'B', b'4', b'0', b'<', 0x0F, 0xA0, b'<']).unwrap();
        assert_eq!(command.numeric_value(), Some(1000.0));
        let command = parse(&profile, &[b'B', b'5', b'1', b'<', 0x0F, 0xA0]).unwrap();
        assert_eq!(command.pid(), Some(Pid::Rpm));
    }

    #[test]
    fn test_short_value_is_zero_padded() {
        let profile = DriveDeckSport::default();
        let command = parse(&profile, &[b'B', b'4', b'1', b'<', 88, b'<']).unwrap();
        assert_eq!(command.pid(), Some(Pid::Speed));
        assert_eq!(command.numeric_value(), Some(88.0));
    }

    #[test]
    fn test_frames_without_value() {
        let profile = DriveDeckSport::default();
        assert!(parse(&profile, b"B41<<").is_none());
        assert!(parse(&profile, b"B4").is_none());
        assert!(parse(&profile, b"").is_none());
        assert!(parse(&profile, b"X1234").is_none());
        // unknown id
        assert!(parse(&profile, b"B99<ab").is_none());
        assert_eq!(profile.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_lambda_frame_is_rejected() {
        let profile = DriveDeckSport::default();
        assert!(parse(&profile, &[b'B', b'4', b'D', b'<', 0x80, 0x00]).is_none());
        assert_eq!(profile.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_vin_connects() {
        let profile = DriveDeckSport::default();
        assert!(parse(&profile, b"B15WVWZZZ1JZXW000001").is_none());
        assert_eq!(profile.vin().as_deref(), Some("WVWZZZ1JZXW000001"));
        assert_eq!(profile.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_protocol_frame() {
        let profile = DriveDeckSport::default();
        assert!(parse(&profile, b"C9").is_none());
        assert_eq!(profile.connection_state(), ConnectionState::Disconnected);

        assert!(parse(&profile, b"C1").is_none());
        assert_eq!(profile.protocol(), Some(ObdProtocol::Iso15765_4Can11bit500));
        assert_eq!(profile.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_verified_is_not_downgraded() {
        let profile = DriveDeckSport::default();
        parse(&profile, b"B52<?0").unwrap();
        parse(&profile, b"C3");
        assert_eq!(profile.connection_state(), ConnectionState::Verified);
    }

    #[test]
    fn test_cycle_command_only_after_quiet_period() {
        let mut profile = DriveDeckSport::default();
        assert_eq!(profile.request_commands().len(), 1);

        parse(&profile, b"B52<?0").unwrap();
        assert!(profile.request_commands().is_empty());
    }

    #[test]
    fn test_metadata_frames() {
        let profile = DriveDeckSport::default();
        for frame in [&b"B14"[..], b"B70<0001", b"B71ECU1", b"B31", b"B32"] {
            assert!(parse(&profile, frame).is_none());
        }
        assert_eq!(profile.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connector_streams_values() {
        let (local, mut remote) = tokio::io::duplex(256);
        let mut connector = DriveDeckSport::connector(Transport::from_stream(local));
        assert_eq!(connector.maximum_tries_for_initialization(), 15);

        connector.execute_initialization_commands().await.unwrap();
        let mut written = [0u8; 1];
        remote.read_exact(&mut written).await.unwrap();
        assert_eq!(&written, b"\r");

        connector.start_executions();
        // nothing arrived yet, so the cycle command goes out
        assert!(connector.execute_request_commands().await.unwrap().is_empty());
        let mut cycle = [0u8; 11];
        remote.read_exact(&mut cycle).await.unwrap();
        assert_eq!(&cycle[..3], b"a17");
        assert_eq!(cycle[10], b'\r');

        remote.write_all(b"C1>B41<x>").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let commands = connector.execute_request_commands().await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].pid(), Some(Pid::Speed));
        assert_eq!(commands[0].numeric_value(), Some(b'x' as f64));
        assert_eq!(connector.connection_state(), ConnectionState::Verified);
    }
}

//! Command Model
//!
//! A [`Command`] is one request/response unit. It knows the bytes it sends,
//! the response-type tag it expects echoed back, and how to classify a framed
//! response into a terminal [`CommandState`].

use crate::pid::Pid;
use crate::protocol::ObdProtocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Status byte an adapter puts in front of every positive Mode 01 answer
pub const STATUS_OK: &str = "41";

/// Mode prefix for current-data requests
pub const CURRENT_DATA_MODE: &str = "01";

/// Line terminator appended to every outgoing command
pub const END_OF_LINE_SEND: u8 = b'\r';

/// Prompt character terminating every ELM327 response
pub const END_OF_LINE_RECEIVE: u8 = b'>';

/// Characters dropped while framing a response
pub const IGNORED_CHARS: &[u8] = b" \r";

const SEARCHING: &str = "SEARCHING";
const STOPPED: &str = "STOPPED";
const NO_DATA: &str = "NODATA";

/// Lifecycle of a single command execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandState {
    /// Created, not yet sent
    New,
    /// Sent, waiting for a response
    Running,
    /// Response understood
    Finished,
    /// Adapter reported an error, no data or garbage
    ExecutionError,
    /// Response belongs to a different PID than the one requested
    UnmatchedResult,
    /// Adapter is still negotiating a bus protocol with the ECU
    Searching,
    /// Command could not be queued for sending
    QueueError,
}

impl CommandState {
    /// Whether the command has left `New`/`Running`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::New | CommandState::Running)
    }
}

/// AT configuration commands of the ELM327 dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// `AT Z`, full adapter reset
    Reset,
    /// `AT D`, restore default settings
    Defaults,
    /// `AT E0`, stop echoing commands
    EchoOff,
    /// `AT L0`, no line feed after carriage returns
    LineFeedOff,
    /// `AT H0`, hide CAN headers
    HeadersOff,
    /// `AT ST <hex>`, ECU response timeout in units of 4 ms
    Timeout(u8),
    /// `AT SP <n>`, select the bus protocol
    SelectProtocol(ObdProtocol),
}

impl ControlCommand {
    /// Command text as sent to the adapter
    pub fn text(&self) -> String {
        match self {
            ControlCommand::Reset => "AT Z".to_string(),
            ControlCommand::Defaults => "AT D".to_string(),
            ControlCommand::EchoOff => "AT E0".to_string(),
            ControlCommand::LineFeedOff => "AT L0".to_string(),
            ControlCommand::HeadersOff => "AT H0".to_string(),
            ControlCommand::Timeout(value) => format!("AT ST {:x}", value),
            ControlCommand::SelectProtocol(protocol) => protocol.to_elm_command(),
        }
    }

    /// Command name
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Reset => "Reset",
            ControlCommand::Defaults => "Defaults",
            ControlCommand::EchoOff => "Echo Off",
            ControlCommand::LineFeedOff => "Line Feed Off",
            ControlCommand::HeadersOff => "Headers Off",
            ControlCommand::Timeout(_) => "Timeout",
            ControlCommand::SelectProtocol(_) => "Select Protocol",
        }
    }
}

/// What a command asks for, and therefore how its response is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// AT command with a free-text answer
    Control(ControlCommand),
    /// Bitmask of supported PIDs after `group`
    PidSupported { group: u8 },
    /// Fuel system status (PID 03)
    FuelSystemStatus,
    /// Numeric or lambda probe measurement
    Measurement(Pid),
    /// Adapter-specific opaque bytes
    Raw,
}

/// Fuel system status of bank 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuelSystemStatus {
    /// Open loop due to insufficient engine temperature
    OpenLoopCold,
    /// Closed loop, using oxygen sensor feedback
    ClosedLoop,
    /// Open loop due to engine load or deceleration fuel cut
    OpenLoopLoad,
    /// Open loop due to system failure
    OpenLoopFailure,
    /// Closed loop with a fault in the feedback system
    ClosedLoopFault,
}

impl FuelSystemStatus {
    /// Map the single set bit of the status byte onto a status
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(FuelSystemStatus::OpenLoopCold),
            1 => Some(FuelSystemStatus::ClosedLoop),
            2 => Some(FuelSystemStatus::OpenLoopLoad),
            4 => Some(FuelSystemStatus::OpenLoopFailure),
            8 => Some(FuelSystemStatus::ClosedLoopFault),
            _ => None,
        }
    }

    /// Index of the set bit (0 when none is set)
    pub fn code(&self) -> u8 {
        match self {
            FuelSystemStatus::OpenLoopCold => 0,
            FuelSystemStatus::ClosedLoop => 1,
            FuelSystemStatus::OpenLoopLoad => 2,
            FuelSystemStatus::OpenLoopFailure => 3,
            FuelSystemStatus::ClosedLoopFault => 4,
        }
    }

    /// Whether the engine uses oxygen sensor feedback
    pub fn is_closed_loop(&self) -> bool {
        matches!(
            self,
            FuelSystemStatus::ClosedLoop | FuelSystemStatus::ClosedLoopFault
        )
    }
}

/// Decoded wide-band lambda probe response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaReading {
    /// Probe position (1-based)
    pub probe: u8,
    /// Equivalence ratio (lambda)
    pub equivalence_ratio: f64,
    /// Sensor voltage (V), voltage probes only
    pub voltage: Option<f64>,
    /// Sensor current (mA), current probes only
    pub current: Option<f64>,
}

/// Decoded result of a finished command, computed once per decode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandValue {
    Numeric(f64),
    Text(String),
    Raw(Vec<u8>),
    PidSet(BTreeSet<Pid>),
    FuelSystem(FuelSystemStatus),
    Lambda(LambdaReading),
}

/// A request/response unit exchanged with an adapter
#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    name: String,
    response_type: String,
    outgoing: Vec<u8>,
    state: CommandState,
    raw: Vec<u8>,
    buffer: Vec<u8>,
    value: Option<CommandValue>,
    result_time: u64,
    awaits_results: bool,
    response_required: bool,
    send_delay: Option<Duration>,
}

impl Command {
    fn new(kind: CommandKind, name: String, response_type: String, outgoing: Vec<u8>) -> Self {
        Self {
            kind,
            name,
            response_type,
            outgoing,
            state: CommandState::New,
            raw: Vec::new(),
            buffer: Vec::new(),
            value: None,
            result_time: 0,
            awaits_results: true,
            response_required: true,
            send_delay: None,
        }
    }

    fn mode_01(tag: &str) -> Vec<u8> {
        format!("{} {}", CURRENT_DATA_MODE, tag).into_bytes()
    }

    /// AT configuration command
    pub fn control(control: ControlCommand) -> Self {
        let text = control.text();
        Self::new(
            CommandKind::Control(control),
            control.name().to_string(),
            text.clone(),
            text.into_bytes(),
        )
    }

    /// "PIDs supported" query for the block following `group` (0x00, 0x20, ...)
    pub fn pid_supported(group: u8) -> Self {
        let tag = format!("{:02X}", group);
        Self::new(
            CommandKind::PidSupported { group },
            format!("PID Supported; Group {}", tag),
            tag.clone(),
            Self::mode_01(&tag),
        )
    }

    /// Fuel system status query
    pub fn fuel_system_status() -> Self {
        let pid = Pid::FuelSystemStatus;
        Self::new(
            CommandKind::FuelSystemStatus,
            pid.name(),
            pid.tag(),
            Self::mode_01(&pid.tag()),
        )
    }

    /// Registry entry point: the request command for `pid`
    pub fn for_pid(pid: Pid) -> Self {
        if pid == Pid::FuelSystemStatus {
            return Self::fuel_system_status();
        }
        Self::new(
            CommandKind::Measurement(pid),
            pid.name(),
            pid.tag(),
            Self::mode_01(&pid.tag()),
        )
    }

    /// Opaque adapter-specific bytes that do not produce a response of their own
    pub fn raw(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let mut command = Self::new(CommandKind::Raw, name.into(), String::new(), bytes.into());
        command.awaits_results = false;
        command
    }

    /// Wait `delay` before this command is written
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    /// A missing response is acceptable for this command
    pub fn response_optional(mut self) -> Self {
        self.response_required = false;
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag the adapter echoes back at byte-pair index 1
    pub fn response_type_id(&self) -> &str {
        &self.response_type
    }

    /// PID this command measures, if any
    pub fn pid(&self) -> Option<Pid> {
        match self.kind {
            CommandKind::Measurement(pid) => Some(pid),
            CommandKind::FuelSystemStatus => Some(Pid::FuelSystemStatus),
            _ => None,
        }
    }

    /// Outgoing wire bytes, without the end-of-line byte
    pub fn encode(&self) -> &[u8] {
        &self.outgoing
    }

    pub fn end_of_line_send(&self) -> u8 {
        END_OF_LINE_SEND
    }

    pub fn end_of_line_receive(&self) -> u8 {
        END_OF_LINE_RECEIVE
    }

    pub fn ignored_chars(&self) -> &'static [u8] {
        IGNORED_CHARS
    }

    pub fn awaits_results(&self) -> bool {
        self.awaits_results
    }

    pub fn response_required(&self) -> bool {
        self.response_required
    }

    pub fn send_delay(&self) -> Option<Duration> {
        self.send_delay
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn set_state(&mut self, state: CommandState) {
        self.state = state;
    }

    /// Unix ms at which the response was accepted
    pub fn result_time(&self) -> u64 {
        self.result_time
    }

    pub fn set_result_time(&mut self, timestamp_ms: u64) {
        self.result_time = timestamp_ms;
    }

    /// Last framed response as received
    pub fn raw_data(&self) -> &[u8] {
        &self.raw
    }

    /// Response text, lossily decoded
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }

    /// Decoded hex pairs of the last response, status and tag included
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn value(&self) -> Option<&CommandValue> {
        self.value.as_ref()
    }

    pub fn numeric_value(&self) -> Option<f64> {
        match self.value {
            Some(CommandValue::Numeric(value)) => Some(value),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.value {
            Some(CommandValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn supported_pids(&self) -> Option<&BTreeSet<Pid>> {
        match &self.value {
            Some(CommandValue::PidSet(pids)) => Some(pids),
            _ => None,
        }
    }

    pub fn fuel_system(&self) -> Option<FuelSystemStatus> {
        match self.value {
            Some(CommandValue::FuelSystem(status)) => Some(status),
            _ => None,
        }
    }

    pub fn lambda(&self) -> Option<LambdaReading> {
        match self.value {
            Some(CommandValue::Lambda(reading)) => Some(reading),
            _ => None,
        }
    }

    /// Fuel system status reports oxygen sensor feedback
    pub fn is_in_closed_loop(&self) -> bool {
        self.fuel_system().is_some_and(|status| status.is_closed_loop())
    }

    /// Classify a terminator-stripped response frame and decode its value
    pub fn decode(&mut self, raw: &[u8]) -> CommandState {
        self.raw = raw.to_vec();
        self.buffer.clear();
        self.value = None;

        let outcome = match self.kind {
            CommandKind::Control(_) => Ok(CommandValue::Text(self.raw_text())),
            CommandKind::Raw => Ok(CommandValue::Raw(raw.to_vec())),
            CommandKind::PidSupported { group } => self.decode_pid_supported(group),
            CommandKind::FuelSystemStatus => self.decode_fuel_system_status(),
            CommandKind::Measurement(pid) => self.decode_measurement(pid),
        };

        self.state = match outcome {
            Ok(value) => {
                self.value = Some(value);
                CommandState::Finished
            }
            Err(state) => state,
        };
        self.state
    }

    /// Shared Mode 01 classification: searching, no data, status, tag, hex pairs
    fn decode_hex_frame(&self, frame: &[u8]) -> Result<Vec<u8>, CommandState> {
        let text = String::from_utf8_lossy(frame);
        if text.contains(SEARCHING) || text.contains(STOPPED) {
            return Err(CommandState::Searching);
        }
        if frame.is_empty() || text.contains(NO_DATA) {
            return Err(CommandState::ExecutionError);
        }

        let mut buffer = Vec::with_capacity(frame.len() / 2);
        for (index, pair) in frame.chunks_exact(2).enumerate() {
            if index == 0 && pair != STATUS_OK.as_bytes() {
                return Err(CommandState::ExecutionError);
            }
            if index == 1 && !pair.eq_ignore_ascii_case(self.response_type.as_bytes()) {
                return Err(CommandState::UnmatchedResult);
            }
            buffer.push(parse_hex_pair(pair).ok_or(CommandState::ExecutionError)?);
        }

        if buffer.len() < 2 {
            return Err(CommandState::ExecutionError);
        }
        Ok(buffer)
    }

    fn decode_measurement(&mut self, pid: Pid) -> Result<CommandValue, CommandState> {
        self.buffer = self.decode_hex_frame(&self.raw)?;
        let data = &self.buffer[2..];

        match pid {
            Pid::LambdaVoltage(probe) | Pid::LambdaCurrent(probe) => {
                if data.len() < pid.response_bytes() {
                    return Err(CommandState::ExecutionError);
                }
                let equivalence_ratio = word(data[0], data[1]) / 32768.0;
                let cd = word(data[2], data[3]);
                let (voltage, current) = match pid {
                    Pid::LambdaVoltage(_) => (Some(cd / 8192.0), None),
                    _ => (None, Some(cd / 256.0 - 128.0)),
                };
                Ok(CommandValue::Lambda(LambdaReading {
                    probe,
                    equivalence_ratio,
                    voltage,
                    current,
                }))
            }
            _ => pid
                .decode_value(data)
                .map(CommandValue::Numeric)
                .ok_or(CommandState::ExecutionError),
        }
    }

    fn decode_fuel_system_status(&mut self) -> Result<CommandValue, CommandState> {
        self.buffer = self.decode_hex_frame(&self.raw)?;
        if self.raw.len() != 6 && self.raw.len() != 8 {
            return Err(CommandState::ExecutionError);
        }
        // The second byte describes fuel system 2, which is not evaluated
        FuelSystemStatus::from_raw(self.buffer[2])
            .map(CommandValue::FuelSystem)
            .ok_or(CommandState::ExecutionError)
    }

    fn decode_pid_supported(&mut self, group: u8) -> Result<CommandValue, CommandState> {
        // Drop adapter noise such as "SEARCHING..." in front of the answer
        let marker = format!("{}{:02X}", STATUS_OK, group);
        let start = self
            .raw
            .windows(marker.len())
            .position(|window| window == marker.as_bytes())
            .unwrap_or(0);
        let frame = self.raw[start..].to_vec();

        self.buffer = self.decode_hex_frame(&frame)?;
        if frame.len() != 12 {
            return Err(CommandState::ExecutionError);
        }

        let mask = u32::from_be_bytes([
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
            self.buffer[5],
        ]);
        let pids = (0..32u16)
            .filter(|bit| mask & (1 << (31 - bit)) != 0)
            .filter_map(|bit| u8::try_from(group as u16 + bit + 1).ok())
            .filter_map(Pid::from_code)
            .collect();
        Ok(CommandValue::PidSet(pids))
    }
}

fn word(high: u8, low: u8) -> f64 {
    high as f64 * 256.0 + low as f64
}

fn parse_hex_pair(pair: &[u8]) -> Option<u8> {
    if !pair.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(pair).ok()?;
    u8::from_str_radix(text, 16).ok()
}

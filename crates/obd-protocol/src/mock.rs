//! Mock ELM327 Adapter
//!
//! In-process emulation of an ELM327 adapter served over an in-memory duplex
//! pipe. Used by tests and by the client when no hardware is attached.

use crate::pid::Pid;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::debug;

/// Supported-PID mask for group 00: PIDs 03-07, 0B-0D, 0F-11
pub const DEFAULT_SUPPORTED_MASK: u32 = 0x3E3B_8000;

const NO_DATA: &str = "NO DATA";

/// Behaviour of the emulated adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Identification printed after a reset
    pub banner: String,
    /// The banner only appears as the answer to the command following `AT Z`,
    /// and that command is otherwise ignored
    pub slow_reset: bool,
    /// Answer to `01 00`, bit 31 meaning PID 01
    pub supported_mask: u32,
    /// PIDs answered with "NO DATA" despite the mask
    pub unsupported: Vec<Pid>,
    /// Number of PID requests answered with "SEARCHING..." first
    pub searching_replies: u32,
    /// Number of measurement requests whose answer is preceded by a stray
    /// frame carrying a different PID tag
    pub mismatched_replies: u32,
    /// The single lambda probe position that answers
    pub lambda_probe: Option<u8>,
    /// Never answer anything
    pub silent: bool,
    /// Close the stream after this many command lines
    pub hang_up_after: Option<u64>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            banner: "ELM327 v1.5".to_string(),
            slow_reset: false,
            supported_mask: DEFAULT_SUPPORTED_MASK,
            unsupported: Vec::new(),
            searching_replies: 0,
            mismatched_replies: 0,
            lambda_probe: None,
            silent: false,
            hang_up_after: None,
        }
    }
}

impl MockConfig {
    /// Adapter whose reset banner lags one command behind, like many clones
    pub fn slow_reset() -> Self {
        Self {
            slow_reset: true,
            ..Default::default()
        }
    }

    /// Adapter that never answers
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Default::default()
        }
    }
}

/// Emulated ELM327 adapter state
#[derive(Debug)]
pub struct MockElm327 {
    config: MockConfig,
    echo: bool,
    resetting: bool,
    requests: u64,
    searching_left: u32,
    mismatched_left: u32,
}

impl MockElm327 {
    pub fn new(config: MockConfig) -> Self {
        let searching_left = config.searching_replies;
        let mismatched_left = config.mismatched_replies;
        Self {
            config,
            echo: true,
            resetting: false,
            requests: 0,
            searching_left,
            mismatched_left,
        }
    }

    /// Serve the adapter on a background task and return the host side of the pipe
    pub fn spawn(self) -> Transport {
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(self.serve(remote));
        Transport::from_stream(local)
    }

    async fn serve(mut self, stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\r', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if let Some(reply) = self.respond(&line) {
                if writer.write_all(&reply).await.is_err() {
                    break;
                }
            }

            if self
                .config
                .hang_up_after
                .is_some_and(|limit| self.requests >= limit)
            {
                debug!("Mock adapter hanging up after {} requests", self.requests);
                break;
            }
        }
        debug!("Mock adapter stopped");
    }

    /// Complete reply to one command line: echo, answer and prompt
    pub fn respond(&mut self, line: &[u8]) -> Option<Vec<u8>> {
        self.requests += 1;
        if self.config.silent {
            return None;
        }

        let echo = self.echo;
        let command: String = String::from_utf8_lossy(line)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        let answer = self.answer(&command);

        let mut reply = Vec::new();
        if let Some(stray) = self.stray_frame(&command) {
            reply.extend_from_slice(stray.as_bytes());
        }
        if echo {
            reply.extend_from_slice(line);
            reply.push(b'\r');
        }
        reply.extend_from_slice(answer.as_bytes());
        reply.extend_from_slice(b"\r\r>");
        Some(reply)
    }

    /// Leftover frame sent ahead of a measurement answer, tagged one PID higher
    fn stray_frame(&mut self, command: &str) -> Option<String> {
        if self.mismatched_left == 0 || command.len() != 4 || !command.starts_with("01") {
            return None;
        }
        let code = u8::from_str_radix(&command[2..], 16).ok().filter(|code| *code != 0)?;
        self.mismatched_left -= 1;
        Some(format!("41 {:02X} 00 00\r\r>", code.wrapping_add(1)))
    }

    fn answer(&mut self, command: &str) -> String {
        if self.resetting {
            self.resetting = false;
            return self.config.banner.clone();
        }

        match command {
            "ATZ" => {
                self.echo = true;
                if self.config.slow_reset {
                    self.resetting = true;
                    String::new()
                } else {
                    self.config.banner.clone()
                }
            }
            "ATD" | "ATE1" => {
                self.echo = true;
                "OK".to_string()
            }
            "ATE0" => {
                self.echo = false;
                "OK".to_string()
            }
            "ATL0" | "ATL1" | "ATH0" | "ATH1" => "OK".to_string(),
            c if c.starts_with("ATST") || c.starts_with("ATSP") => "OK".to_string(),
            c if c.len() == 4 && c.starts_with("01") => self.answer_pid(&c[2..]),
            _ => "?".to_string(),
        }
    }

    fn answer_pid(&mut self, tag: &str) -> String {
        let Ok(code) = u8::from_str_radix(tag, 16) else {
            return "?".to_string();
        };

        if self.searching_left > 0 {
            self.searching_left -= 1;
            return "SEARCHING...".to_string();
        }

        if code == 0x00 {
            return format!("41 00 {}", spaced_hex(&self.config.supported_mask.to_be_bytes()));
        }

        let Some(pid) = Pid::from_code(code) else {
            return NO_DATA.to_string();
        };
        if self.config.unsupported.contains(&pid) {
            return NO_DATA.to_string();
        }
        match pid.lambda_probe() {
            Some(probe) if Some(probe) != self.config.lambda_probe => {
                return NO_DATA.to_string();
            }
            None if !self.is_in_mask(code) => return NO_DATA.to_string(),
            _ => {}
        }

        format!("41 {} {}", pid.tag(), spaced_hex(&self.mock_data(pid)))
    }

    fn is_in_mask(&self, code: u8) -> bool {
        (1..=32).contains(&code) && self.config.supported_mask & (1 << (32 - code as u32)) != 0
    }

    /// Generate plausible data bytes for a PID
    fn mock_data(&self, pid: Pid) -> Vec<u8> {
        // Pseudo-random but deterministic per request
        let mut hasher = DefaultHasher::new();
        self.requests.hash(&mut hasher);
        pid.code().hash(&mut hasher);
        let hash = hasher.finish();

        match pid {
            // RPM: 800-3500 RPM range
            Pid::Rpm => {
                let encoded = (800 + (hash % 2700) as u16) * 4;
                encoded.to_be_bytes().to_vec()
            }
            // Speed: 0-120 km/h
            Pid::Speed => vec![(hash % 120) as u8],
            // Coolant temp: 70-105°C (stored as value + 40)
            Pid::CoolantTemp => vec![(110 + (hash % 35)) as u8],
            // Engine load and throttle: 20-80%
            Pid::EngineLoad | Pid::Throttle => vec![(51 + (hash % 153)) as u8],
            // MAF: 5-50 g/s
            Pid::Maf => ((500 + (hash % 4500)) as u16).to_be_bytes().to_vec(),
            // Fuel trims: -10% to +10%
            Pid::ShortFuelTrim | Pid::LongFuelTrim => vec![(115 + (hash % 26)) as u8],
            // Intake pressure: 30-100 kPa
            Pid::IntakeMap => vec![(30 + (hash % 70)) as u8],
            // Intake air temperature: 10-40°C
            Pid::IntakeAirTemp => vec![(50 + (hash % 30)) as u8],
            // Fuel pressure: 150-300 kPa
            Pid::FuelPressure => vec![(50 + (hash % 50)) as u8],
            // Open loop due to engine load, no second fuel system
            Pid::FuelSystemStatus => vec![0x02, 0x00],
            // Lambda around 1.0
            Pid::LambdaVoltage(_) | Pid::LambdaCurrent(_) => {
                vec![0x80, (hash % 32) as u8, 0x80, (hash % 256) as u8]
            }
        }
    }
}

fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}

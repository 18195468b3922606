//! ELM327 Profile

use crate::connector::{ConnectionState, ConnectorOptions};
use crate::sequential::{SequentialConnector, SequentialProfile};
use obd_protocol::{Command, CommandKind, ControlCommand, ObdProtocol, Transport};

/// Successful setup answers needed before the adapter counts as connected
pub const ELM327_CONNECTED_COUNT: u32 = 5;

/// ECU response timeout sent during setup (x 4 ms)
pub const ELM327_TIMEOUT: u8 = 62;

/// Generic ELM327 adapter
#[derive(Debug, Default)]
pub struct Elm327 {
    successful_count: u32,
}

impl Elm327 {
    /// Sequential connector running this profile
    pub fn connector(transport: Transport, options: ConnectorOptions) -> SequentialConnector<Self> {
        SequentialConnector::new(Self::default(), transport, options)
    }

    pub fn successful_count(&self) -> u32 {
        self.successful_count
    }
}

/// Score one setup answer the way a genuine ELM327 replies
pub(crate) fn elm327_score(command: &Command) -> u32 {
    let Some(content) = command.text() else {
        return 0;
    };

    let counted = match command.kind() {
        CommandKind::Control(ControlCommand::EchoOff) => {
            content.contains("ELM327v1.") || (content.contains("ATE0") && content.contains("OK"))
        }
        CommandKind::Control(
            ControlCommand::LineFeedOff
            | ControlCommand::Timeout(_)
            | ControlCommand::SelectProtocol(_),
        ) => content.contains("OK"),
        _ => false,
    };
    counted as u32
}

/// Setup sequence shared by the ELM327 family
pub(crate) fn elm327_initialization(echo_off: Command) -> Vec<Command> {
    vec![
        Command::control(ControlCommand::Reset),
        echo_off.clone(),
        echo_off,
        Command::control(ControlCommand::LineFeedOff),
        Command::control(ControlCommand::Timeout(ELM327_TIMEOUT)),
        Command::control(ControlCommand::SelectProtocol(ObdProtocol::Auto)),
    ]
}

impl SequentialProfile for Elm327 {
    fn name(&self) -> &'static str {
        "ELM327"
    }

    fn supports_device(&self, device_name: &str) -> bool {
        device_name.contains("OBDII") || device_name.contains("ELM327")
    }

    fn initialization_commands(&self) -> Vec<Command> {
        elm327_initialization(Command::control(ControlCommand::EchoOff))
    }

    fn process_initialization_command(&mut self, command: &Command) {
        self.successful_count += elm327_score(command);
    }

    fn connection_state(&self) -> ConnectionState {
        if self.successful_count >= ELM327_CONNECTED_COUNT {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

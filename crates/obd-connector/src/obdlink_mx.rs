//! OBDLink MX Profile

use crate::connector::{ConnectionState, ConnectorOptions};
use crate::sequential::{SequentialConnector, SequentialProfile};
use obd_protocol::{Command, CommandKind, ControlCommand, ObdProtocol, Transport};

pub const OBDLINK_MX_CONNECTED_COUNT: u32 = 4;

/// OBDLink MX (STN11xx chipset, ELM327 compatible dialect)
#[derive(Debug, Default)]
pub struct ObdLinkMx {
    successful_count: u32,
}

impl ObdLinkMx {
    pub fn connector(transport: Transport, options: ConnectorOptions) -> SequentialConnector<Self> {
        SequentialConnector::new(Self::default(), transport, options)
    }
}

impl SequentialProfile for ObdLinkMx {
    fn name(&self) -> &'static str {
        "OBDLink MX"
    }

    fn supports_device(&self, device_name: &str) -> bool {
        device_name.contains("OBDLink MX")
    }

    fn initialization_commands(&self) -> Vec<Command> {
        vec![
            Command::control(ControlCommand::Reset),
            Command::control(ControlCommand::Defaults),
            Command::control(ControlCommand::EchoOff),
            Command::control(ControlCommand::LineFeedOff),
            Command::control(ControlCommand::HeadersOff),
            Command::control(ControlCommand::SelectProtocol(ObdProtocol::Auto)),
        ]
    }

    fn process_initialization_command(&mut self, command: &Command) {
        let Some(content) = command.text() else {
            return;
        };
        let counted = match command.kind() {
            CommandKind::Control(ControlCommand::Reset) => {
                content.contains("ELM327") || content.contains("STN")
            }
            CommandKind::Control(_) => content.contains("OK"),
            _ => false,
        };
        self.successful_count += counted as u32;
    }

    fn connection_state(&self) -> ConnectionState {
        if self.successful_count >= OBDLINK_MX_CONNECTED_COUNT {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn maximum_tries_for_initialization(&self) -> u32 {
        2
    }
}

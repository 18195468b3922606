//! AposW3 Profile
//!
//! ELM327 derivative that drops setup commands arriving too quickly after a
//! reset. Echo-off is delayed and may go unanswered.

use crate::connector::{ConnectionState, ConnectorOptions};
use crate::elm327::{elm327_initialization, elm327_score};
use crate::sequential::{SequentialConnector, SequentialProfile};
use obd_protocol::{Command, CommandKind, ControlCommand, Transport};
use std::time::Duration;

pub const APOS_W3_CONNECTED_COUNT: u32 = 4;

/// Pause before each echo-off command
pub const APOS_ECHO_OFF_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
pub struct AposW3 {
    successful_count: u32,
}

impl AposW3 {
    pub fn connector(transport: Transport, options: ConnectorOptions) -> SequentialConnector<Self> {
        SequentialConnector::new(Self::default(), transport, options)
    }
}

impl SequentialProfile for AposW3 {
    fn name(&self) -> &'static str {
        "AposW3"
    }

    fn supports_device(&self, device_name: &str) -> bool {
        device_name.contains("APOS") && device_name.contains("OBD_W3")
    }

    fn initialization_commands(&self) -> Vec<Command> {
        let echo_off = Command::control(ControlCommand::EchoOff)
            .with_send_delay(APOS_ECHO_OFF_DELAY)
            .response_optional();
        elm327_initialization(echo_off)
    }

    fn process_initialization_command(&mut self, command: &Command) {
        self.successful_count += match command.kind() {
            CommandKind::Control(ControlCommand::EchoOff) => {
                command.text().is_some_and(|content| content.contains("OK")) as u32
            }
            _ => elm327_score(command),
        };
    }

    fn connection_state(&self) -> ConnectionState {
        if self.successful_count >= APOS_W3_CONNECTED_COUNT {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use obd_protocol::mock::{MockConfig, MockElm327};

    #[test]
    fn test_supports_device() {
        let profile = AposW3::default();
        assert!(profile.supports_device("APOS OBD_W3"));
        assert!(!profile.supports_device("APOS"));
        assert!(!profile.supports_device("OBDII"));
    }

    #[test]
    fn test_echo_off_is_delayed_and_optional() {
        let commands = AposW3::default().initialization_commands();
        let echo_off = &commands[1];
        assert_eq!(echo_off.send_delay(), Some(APOS_ECHO_OFF_DELAY));
        assert!(!echo_off.response_required());
        assert!(commands[0].response_required());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_regular_reset() {
        let transport = MockElm327::new(MockConfig::default()).spawn();
        let mut connector = AposW3::connector(transport, ConnectorOptions::default());
        connector.execute_initialization_commands().await.unwrap();
        assert_eq!(connector.connection_state(), ConnectionState::Connected);
    }
}

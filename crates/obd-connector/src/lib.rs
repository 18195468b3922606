//! OBD-II Adapter Connectors
//!
//! Adapter-specific connection policy on top of `obd-protocol`: the
//! request/response engine for the ELM327 family, the push-style engine with
//! its background reader, and the concrete adapter profiles.

mod apos_w3;
mod asynchronous;
mod blacklist;
mod connector;
mod drivedeck;
mod elm327;
mod obdlink_mx;
mod response_reader;
mod sequential;

pub use apos_w3::AposW3;
pub use asynchronous::{AsynchronousConnector, AsynchronousProfile, INITIALIZATION_COMMAND_DELAY};
pub use blacklist::{CommandBlacklist, MIN_BLACKLIST_COUNT};
pub use connector::{ConnectionState, Connector, ConnectorOptions};
pub use drivedeck::{cycle_command, DriveDeckParser, DriveDeckSport, DriveDeckStatus, CYCLE_PIDS};
pub use elm327::Elm327;
pub use obdlink_mx::ObdLinkMx;
pub use response_reader::{ResponseParser, ResponseReader, MAX_BUFFERED_COMMANDS};
pub use sequential::{
    SequentialConnector, SequentialProfile, INITIALIZATION_TIMEOUT, MAX_TIMEOUT,
};

use obd_protocol::Transport;

/// Fresh connector candidates in fallback order: ELM327, AposW3, OBDLink MX, DriveDeck Sport
pub fn default_candidates(
    transport: &Transport,
    options: &ConnectorOptions,
) -> Vec<Box<dyn Connector>> {
    vec![
        Box::new(Elm327::connector(transport.clone(), options.clone())),
        Box::new(AposW3::connector(transport.clone(), options.clone())),
        Box::new(ObdLinkMx::connector(transport.clone(), options.clone())),
        Box::new(DriveDeckSport::connector(transport.clone())),
    ]
}

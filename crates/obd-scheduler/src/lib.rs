//! OBD-II Command Looper
//!
//! Runs an adapter session on top of `obd-connector`: adapter preselection
//! and round-robin fallback, the measurement cycle, the no-data watchdog
//! and the listener callbacks that report all of it.

mod config;
mod listener;
mod looper;
mod monitor;

pub use config::LooperConfig;
pub use listener::{ChannelListener, ConnectionListener, DataListener, LooperEvent};
pub use looper::{CandidateFactory, CommandLooper, LooperHandle, Phase};
pub use monitor::{LiveMonitor, SuccessClock};

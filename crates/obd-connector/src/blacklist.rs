//! Command Blacklist
//!
//! Session-scoped record of commands that keep failing. A command name that
//! fails more than [`MIN_BLACKLIST_COUNT`] times in a row is skipped for the
//! rest of the session unless it is whitelisted.

use std::collections::{HashMap, HashSet};
use tracing::info;

/// Consecutive failures tolerated before a command is blacklisted
pub const MIN_BLACKLIST_COUNT: u32 = 5;

/// Per-session failure counters and the resulting blacklist
#[derive(Debug, Clone, Default)]
pub struct CommandBlacklist {
    candidates: HashMap<String, u32>,
    blacklisted: HashSet<String>,
    whitelist: HashSet<String>,
}

impl CommandBlacklist {
    pub fn new<I, S>(whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Count a failed execution; returns `true` if this blacklisted the command
    pub fn record_failure(&mut self, name: &str) -> bool {
        if self.blacklisted.contains(name) || self.whitelist.contains(name) {
            return false;
        }

        let count = self.candidates.entry(name.to_string()).or_insert(0);
        *count += 1;
        if *count > MIN_BLACKLIST_COUNT {
            info!("Blacklisting command: {}", name);
            self.candidates.remove(name);
            self.blacklisted.insert(name.to_string());
            return true;
        }
        false
    }

    /// A successful execution breaks the run of failures
    pub fn record_success(&mut self, name: &str) {
        self.candidates.remove(name);
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklisted.contains(name)
    }

    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.whitelist.contains(name)
    }

    /// Current consecutive failure count for `name`
    pub fn failure_count(&self, name: &str) -> u32 {
        self.candidates.get(name).copied().unwrap_or(0)
    }

    pub fn blacklisted(&self) -> impl Iterator<Item = &str> {
        self.blacklisted.iter().map(String::as_str)
    }
}

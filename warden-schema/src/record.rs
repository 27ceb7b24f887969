//! Offense record and block state.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Clean,
    Watched,
    TemporarilyBlocked,
    PermanentlyBlocked,
}

impl BlockState {
    /// True for both temporary and permanent blocks.
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            BlockState::TemporarilyBlocked | BlockState::PermanentlyBlocked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockState::Clean => "clean",
            BlockState::Watched => "watched",
            BlockState::TemporarilyBlocked => "temporarily_blocked",
            BlockState::PermanentlyBlocked => "permanently_blocked",
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offense history for one source address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffenseRecord {
    pub ip: IpAddr,
    /// Attempts observed in the current tracking window.
    pub attempt_count: u32,
    /// Start of the current tracking window (Unix seconds).
    pub first_seen: u64,
    /// Most recent attempt (Unix seconds).
    pub last_seen: u64,
    /// Temporary blocks served so far; drives permanent escalation.
    pub block_count: u32,
    pub state: BlockState,
    /// When a temporary block lapses. `None` unless temporarily blocked.
    pub block_expires_at: Option<u64>,
}

impl OffenseRecord {
    /// A fresh record whose window opens at `now`.
    pub fn new(ip: IpAddr, now: u64) -> Self {
        Self {
            ip,
            attempt_count: 0,
            first_seen: now,
            last_seen: now,
            block_count: 0,
            state: BlockState::Clean,
            block_expires_at: None,
        }
    }

    /// Count one attempt seen at `ts`.
    ///
    /// `last_seen` never moves backwards, so an out-of-order line cannot
    /// rewind the record.
    pub fn record_attempt(&mut self, ts: u64) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_seen = self.last_seen.max(ts);
    }

    /// Restart the tracking window at `now` with zero attempts.
    ///
    /// `last_seen` is pulled up to the new window start so a late line
    /// counted afterwards cannot leave it behind `first_seen`.
    pub fn reset_window(&mut self, now: u64) {
        self.attempt_count = 0;
        self.first_seen = now;
        self.last_seen = self.last_seen.max(now);
    }

    /// Check the structural invariants that must hold for any stored record.
    pub fn check_invariants(&self) -> Result<(), String> {
        match (self.state, self.block_expires_at) {
            (BlockState::PermanentlyBlocked, Some(_)) => {
                Err("permanent block must not carry an expiry".to_string())
            }
            (BlockState::TemporarilyBlocked, None) => {
                Err("temporary block requires an expiry".to_string())
            }
            (BlockState::Clean | BlockState::Watched, Some(_)) => {
                Err(format!("{} record must not carry an expiry", self.state))
            }
            _ if self.last_seen < self.first_seen && self.attempt_count > 0 => {
                Err("last_seen precedes first_seen".to_string())
            }
            _ => Ok(()),
        }
    }
}

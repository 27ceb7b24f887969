//! Audit line format.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::record::BlockState;

/// Why a record changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// First counted attempt from a clean address.
    AttemptObserved,
    /// Attempt limit reached inside the window.
    AttemptLimitReached,
    /// Attempt limit reached again after enough temporary blocks.
    RepeatOffender,
    /// Temporary block served and lifted.
    BlockExpired,
    /// Tracking window lapsed below the attempt limit.
    WindowLapsed,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::AttemptObserved => "attempt_observed",
            ReasonCode::AttemptLimitReached => "attempt_limit_reached",
            ReasonCode::RepeatOffender => "repeat_offender",
            ReasonCode::BlockExpired => "block_expired",
            ReasonCode::WindowLapsed => "window_lapsed",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit line. Written once, never read back by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts_unix_sec: u64,
    pub ip: IpAddr,
    pub previous_state: BlockState,
    pub new_state: BlockState,
    pub attempt_count: u32,
    pub reason: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_expires_at: Option<u64>,
}

impl AuditEntry {
    /// Serialize to a JSON line (no trailing newline).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("AuditEntry serialization should never fail")
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

//! Versioned state file: ledger records, log cursor and queued firewall work.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{BlockState, OffenseRecord};

/// Current state file schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors decoding a state file.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("invalid address key: {0:?}")]
    InvalidAddress(String),

    #[error("record for {ip} is inconsistent: {reason}")]
    Inconsistent { ip: String, reason: String },
}

/// Position in the firewall log up to which events have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    /// Identity of the log file (inode); changes on rotation.
    pub file_id: u64,
    /// Byte offset just past the last applied line.
    pub offset: u64,
}

/// Firewall call the engine still owes the firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FirewallAction {
    TemporaryBlock { duration_secs: u64 },
    PermanentBlock,
    Unblock,
}

impl fmt::Display for FirewallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallAction::TemporaryBlock { duration_secs } => {
                write!(f, "temporary block ({duration_secs}s)")
            }
            FirewallAction::PermanentBlock => f.write_str("permanent block"),
            FirewallAction::Unblock => f.write_str("unblock"),
        }
    }
}

/// A firewall action that failed and waits for the next cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIntent {
    pub ip: IpAddr,
    pub action: FirewallAction,
    /// Attempt count that triggered the action, for the audit line.
    pub attempt_count: u32,
    pub queued_at: u64,
    /// Failed dispatches so far.
    pub failures: u32,
}

/// On-disk form of an offense record; the address is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub attempt_count: u32,
    pub first_seen: u64,
    pub last_seen: u64,
    pub block_count: u32,
    pub state: BlockState,
    pub block_expires_at: Option<u64>,
}

/// Whole-engine durable state, replaced atomically once per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub cursor: Option<LogCursor>,
    #[serde(default)]
    pub records: BTreeMap<String, PersistedRecord>,
    #[serde(default)]
    pub pending: Vec<PendingIntent>,
}

impl StateFile {
    /// Build a state file from a ledger snapshot.
    pub fn new(
        records: &[OffenseRecord],
        cursor: Option<LogCursor>,
        pending: Vec<PendingIntent>,
    ) -> Self {
        let records = records
            .iter()
            .map(|r| {
                (
                    r.ip.to_string(),
                    PersistedRecord {
                        attempt_count: r.attempt_count,
                        first_seen: r.first_seen,
                        last_seen: r.last_seen,
                        block_count: r.block_count,
                        state: r.state,
                        block_expires_at: r.block_expires_at,
                    },
                )
            })
            .collect();

        Self {
            version: SCHEMA_VERSION,
            cursor,
            records,
            pending,
        }
    }

    /// Decode records, validating each address and record invariant.
    pub fn offense_records(&self) -> Result<Vec<OffenseRecord>, SchemaError> {
        self.records
            .iter()
            .map(|(key, body)| {
                let ip: IpAddr = key
                    .parse()
                    .map_err(|_| SchemaError::InvalidAddress(key.clone()))?;
                let record = OffenseRecord {
                    ip,
                    attempt_count: body.attempt_count,
                    first_seen: body.first_seen,
                    last_seen: body.last_seen,
                    block_count: body.block_count,
                    state: body.state,
                    block_expires_at: body.block_expires_at,
                };
                record
                    .check_invariants()
                    .map_err(|reason| SchemaError::Inconsistent {
                        ip: key.clone(),
                        reason,
                    })?;
                Ok(record)
            })
            .collect()
    }

    /// Serialize as pretty JSON for the state file.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("StateFile serialization should never fail")
    }

    /// Deserialize and check the schema version.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let state: StateFile = serde_json::from_str(json)?;
        if state.version != SCHEMA_VERSION {
            return Err(SchemaError::VersionMismatch {
                expected: SCHEMA_VERSION,
                found: state.version,
            });
        }
        Ok(state)
    }
}

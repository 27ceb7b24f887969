//! Firewall Warden persisted formats.
//!
//! Defines the offense record, the versioned state file and the audit line
//! format. Everything here is plain data with serde derives; lifecycle rules
//! live in `warden-engine`.

mod audit;
mod record;
mod state;

pub use audit::{AuditEntry, ReasonCode};
pub use record::{BlockState, OffenseRecord};
pub use state::{
    FirewallAction, LogCursor, PendingIntent, PersistedRecord, SchemaError, StateFile,
    SCHEMA_VERSION,
};

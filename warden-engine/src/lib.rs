//! Firewall Warden engine.
//!
//! Tracks access attempts per source address, escalates repeat offenders
//! from temporary to permanent blocks and persists state plus an audit trail.
//!
//! Pieces, leaves first:
//! - `exclusion` - configured ranges that are never tracked
//! - `ledger` - per-address offense records with per-key locking
//! - `policy` - pure `decide(record, now, thresholds)`
//! - `firewall` - adapter trait the engine drives, plus a mock
//! - `processor` - applies a batch of events, parallel across addresses
//! - `store` / `audit_log` - durable state and append-only audit
//! - `cycle` - one full pass: retry, process, sweep, persist

pub mod audit_log;
pub mod cycle;
pub mod exclusion;
pub mod firewall;
pub mod ledger;
pub mod policy;
pub mod processor;
pub mod store;

pub use audit_log::{AuditError, AuditLog};
pub use cycle::{CycleError, CycleReport, Engine, EventBatch, PersistenceFailure};
pub use exclusion::{is_excluded, parse_address, AddressError, ExclusionSet};
pub use firewall::{AdapterError, BlockDuration, FirewallAdapter, FirewallCall, MockFirewall};
pub use ledger::{Ledger, LedgerError};
pub use policy::{decide, EscalationPoint, ThresholdError, Thresholds, Transition};
pub use processor::{AccessEvent, AdapterFailure, EventProcessor, ProcessOutcome, SkippedEvent};
pub use store::{StateError, StateStore};

pub use warden_schema::{
    AuditEntry, BlockState, FirewallAction, LogCursor, OffenseRecord, PendingIntent, ReasonCode,
    StateFile,
};

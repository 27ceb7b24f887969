//! Cycle orchestration.
//!
//! One cycle, in order:
//! 1. retry firewall work queued by earlier cycles
//! 2. process the new events (replayed offsets are dropped)
//! 3. sweep every record at clock time: lift expired blocks, reset lapsed
//!    windows, forget idle records
//! 4. save the state file, then append the buffered audit entries
//!
//! A cycle always runs to completion unless aborted. Adapter and storage
//! failures degrade it; they never fail it.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::AtomicBool;

use thiserror::Error;
use warden_clock::Clock;
use warden_fs::Filesystem;
use warden_schema::{AuditEntry, LogCursor, PendingIntent, StateFile};

use crate::audit_log::{AuditError, AuditLog};
use crate::exclusion::ExclusionSet;
use crate::firewall::FirewallAdapter;
use crate::ledger::{Ledger, LedgerError};
use crate::policy::{decide, ThresholdError, Thresholds};
use crate::processor::{
    action_applies, apply_transition, confirm, AccessEvent, AdapterFailure, EventProcessor,
    SkippedEvent, Step,
};
use crate::store::{StateError, StateStore};

/// Events read from one log file since the last cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    /// Identity of the log file the events came from.
    pub file_id: u64,
    pub events: Vec<AccessEvent>,
    /// Read position after the last complete line.
    pub end_offset: u64,
    /// The reader started over at offset 0 of the same file (truncation).
    pub rewound: bool,
}

impl EventBatch {
    pub fn new(file_id: u64, events: Vec<AccessEvent>, end_offset: u64) -> Self {
        Self {
            file_id,
            events,
            end_offset,
            rewound: false,
        }
    }

    /// Mark the batch as re-read from the start of a truncated file, so
    /// offsets below the saved cursor are not treated as replays.
    pub fn rewound(mut self) -> Self {
        self.rewound = true;
        self
    }
}

/// Errors that stop the engine from running a cycle at all.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),

    #[error("cannot restore ledger: {0}")]
    Restore(#[from] LedgerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("engine was aborted mid-cycle; restart to resume from the saved state")]
    Aborted,
}

/// A write that failed at the end of a cycle. The data stays in memory.
#[derive(Debug, Error)]
pub enum PersistenceFailure {
    #[error(transparent)]
    State(StateError),

    #[error(transparent)]
    Audit(AuditError),
}

/// What happened during one cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// 1-based cycle number since the engine started.
    pub cycle: u64,
    pub clock_now: u64,
    /// Events applied to the ledger.
    pub events: usize,
    /// Events at or below the saved log offset, dropped unread.
    pub replayed: usize,
    pub skipped: Vec<SkippedEvent>,
    pub excluded: usize,
    /// State changes made this cycle.
    pub audit: Vec<AuditEntry>,
    pub adapter_failures: Vec<AdapterFailure>,
    /// Queued intents that went through this cycle.
    pub retried: usize,
    /// Intents still queued after this cycle.
    pub pending: usize,
    /// Queued intents dropped because their record had moved on.
    pub stale_intents: usize,
    /// Idle records removed by the sweep.
    pub forgotten: usize,
    /// Audit entries held in memory until a write succeeds.
    pub unsaved_audit: usize,
    pub persistence_errors: Vec<PersistenceFailure>,
    pub aborted: bool,
}

impl CycleReport {
    fn new(cycle: u64, clock_now: u64) -> Self {
        Self {
            cycle,
            clock_now,
            ..Self::default()
        }
    }

    /// True if firewall or storage work failed and is carried over.
    pub fn degraded(&self) -> bool {
        !self.adapter_failures.is_empty() || !self.persistence_errors.is_empty()
    }
}

/// Owns the ledger and everything that must survive between cycles.
#[derive(Debug)]
pub struct Engine {
    ledger: Ledger,
    exclusions: ExclusionSet,
    thresholds: Thresholds,
    cursor: Option<LogCursor>,
    pending: Vec<PendingIntent>,
    unsaved_audit: Vec<AuditEntry>,
    cycles: u64,
    aborted: bool,
}

impl Engine {
    /// Empty engine.
    pub fn new(thresholds: Thresholds, exclusions: ExclusionSet) -> Result<Self, CycleError> {
        thresholds.validate()?;
        Ok(Self {
            ledger: Ledger::new(),
            exclusions,
            thresholds,
            cursor: None,
            pending: Vec::new(),
            unsaved_audit: Vec::new(),
            cycles: 0,
            aborted: false,
        })
    }

    /// Engine resumed from a saved state file.
    pub fn restore(
        state: StateFile,
        thresholds: Thresholds,
        exclusions: ExclusionSet,
    ) -> Result<Self, CycleError> {
        let records = state
            .offense_records()
            .map_err(|e| CycleError::State(StateError::Corrupt(e)))?;
        let mut engine = Self::new(thresholds, exclusions)?;
        engine.ledger = Ledger::load(records)?;
        engine.cursor = state.cursor;
        engine.pending = state.pending;
        Ok(engine)
    }

    /// Load from `store`. A corrupt state file is discarded: the engine
    /// starts empty and the error is handed back for logging.
    pub fn from_store<F: Filesystem>(
        store: &StateStore<F>,
        thresholds: Thresholds,
        exclusions: ExclusionSet,
    ) -> Result<(Self, Option<StateError>), CycleError> {
        match store.load() {
            Ok(Some(state)) => match Self::restore(state, thresholds, exclusions.clone()) {
                Ok(engine) => Ok((engine, None)),
                Err(CycleError::State(e)) => Ok((Self::new(thresholds, exclusions)?, Some(e))),
                Err(e) => Err(e),
            },
            Ok(None) => Ok((Self::new(thresholds, exclusions)?, None)),
            Err(e @ StateError::Corrupt(_)) => Ok((Self::new(thresholds, exclusions)?, Some(e))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn exclusions(&self) -> &ExclusionSet {
        &self.exclusions
    }

    /// Log position up to which events have been applied.
    pub fn cursor(&self) -> Option<LogCursor> {
        self.cursor
    }

    pub fn pending(&self) -> &[PendingIntent] {
        &self.pending
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Current durable state.
    pub fn state_file(&self) -> StateFile {
        StateFile::new(&self.ledger.snapshot(), self.cursor, self.pending.clone())
    }

    /// Run one full cycle over `batch`.
    pub fn run_cycle<S: Filesystem, A: Filesystem>(
        &mut self,
        batch: EventBatch,
        adapter: &dyn FirewallAdapter,
        clock: &dyn Clock,
        store: &StateStore<S>,
        audit_log: &AuditLog<A>,
        abort: Option<&AtomicBool>,
    ) -> Result<CycleReport, CycleError> {
        if self.aborted {
            return Err(CycleError::Aborted);
        }

        self.cycles += 1;
        let now = clock.now_unix_sec();
        let mut report = CycleReport::new(self.cycles, now);

        self.retry_pending(adapter, now, &mut report);

        let events = self.drop_replayed(&batch, &mut report);
        let suppressed: HashSet<IpAddr> = self.pending.iter().map(|p| p.ip).collect();
        let outcome = EventProcessor::new(
            &self.ledger,
            &self.exclusions,
            &self.thresholds,
            adapter,
            now,
        )
        .with_suppressed(suppressed)
        .with_abort(abort)
        .process(&events);

        report.events = outcome.processed;
        report.skipped = outcome.skipped;
        report.excluded = outcome.excluded;
        report.audit.extend(outcome.audit);
        report.adapter_failures.extend(outcome.adapter_failures);
        self.pending.extend(outcome.pending);

        if outcome.aborted {
            // Nothing from this cycle is persisted; the saved cursor still
            // points before the batch, so a restart replays it cleanly.
            self.aborted = true;
            report.aborted = true;
            report.pending = self.pending.len();
            return Ok(report);
        }

        self.sweep(adapter, now, &mut report);

        self.cursor = Some(LogCursor {
            file_id: batch.file_id,
            offset: batch.end_offset,
        });
        self.unsaved_audit.extend(report.audit.iter().cloned());
        self.persist(store, audit_log, &mut report);

        report.pending = self.pending.len();
        report.unsaved_audit = self.unsaved_audit.len();
        Ok(report)
    }

    fn retry_pending(&mut self, adapter: &dyn FirewallAdapter, now: u64, report: &mut CycleReport) {
        let queued = std::mem::take(&mut self.pending);

        for mut intent in queued {
            let live = self
                .ledger
                .get(intent.ip)
                .is_some_and(|record| action_applies(&record, intent.action));
            if !live {
                report.stale_intents += 1;
                continue;
            }

            match confirm(
                &self.ledger,
                adapter,
                intent.ip,
                intent.action,
                intent.attempt_count,
                now,
                now,
            ) {
                Ok(entry) => {
                    report.retried += 1;
                    report.audit.extend(entry);
                }
                Err(error) => {
                    intent.failures = intent.failures.saturating_add(1);
                    report.adapter_failures.push(AdapterFailure {
                        ip: intent.ip,
                        action: intent.action,
                        error,
                    });
                    self.pending.push(intent);
                }
            }
        }
    }

    fn drop_replayed(&self, batch: &EventBatch, report: &mut CycleReport) -> Vec<AccessEvent> {
        let committed = match self.cursor {
            Some(cursor) if cursor.file_id == batch.file_id && !batch.rewound => cursor.offset,
            _ => 0,
        };

        let (fresh, replayed): (Vec<AccessEvent>, Vec<AccessEvent>) = batch
            .events
            .iter()
            .cloned()
            .partition(|event| committed == 0 || event.end_offset > committed);
        report.replayed = replayed.len();
        fresh
    }

    fn sweep(&mut self, adapter: &dyn FirewallAdapter, now: u64, report: &mut CycleReport) {
        let thresholds = self.thresholds;
        let suppressed: HashSet<IpAddr> = self.pending.iter().map(|p| p.ip).collect();

        for ip in self.ledger.ips() {
            if suppressed.contains(&ip) {
                continue;
            }

            let step = self.ledger.modify(ip, |record| {
                let transition = decide(record, now, &thresholds);
                apply_transition(record, transition, now)
            });

            match step {
                None | Some(Step::Nothing) => {}
                Some(Step::Audited(entry)) => report.audit.push(entry),
                Some(Step::Forget) => {
                    if let Ok(Some(_)) = self.ledger.remove(ip) {
                        report.forgotten += 1;
                    }
                }
                Some(Step::Firewall(action, attempt_count)) => {
                    match confirm(&self.ledger, adapter, ip, action, attempt_count, now, now) {
                        Ok(entry) => report.audit.extend(entry),
                        Err(error) => {
                            self.pending.push(PendingIntent {
                                ip,
                                action,
                                attempt_count,
                                queued_at: now,
                                failures: 1,
                            });
                            report.adapter_failures.push(AdapterFailure { ip, action, error });
                        }
                    }
                }
            }
        }
    }

    fn persist<S: Filesystem, A: Filesystem>(
        &mut self,
        store: &StateStore<S>,
        audit_log: &AuditLog<A>,
        report: &mut CycleReport,
    ) {
        if let Err(e) = store.save(&self.state_file()) {
            report.persistence_errors.push(PersistenceFailure::State(e));
        }

        if let Err(e) = audit_log.flush(&mut self.unsaved_audit) {
            report.persistence_errors.push(PersistenceFailure::Audit(e));
        }
    }
}

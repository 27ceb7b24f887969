//! Event processor.
//!
//! Takes a batch of `(ip, timestamp)` events and drives each through the
//! exclusion gate, the ledger and the policy. Events are grouped by address;
//! groups run in parallel on the rayon pool and each group is applied
//! strictly in arrival order.
//!
//! Firewall-backed transitions only advance a record once the adapter
//! confirms. A failed call becomes a `PendingIntent` and the address is
//! suppressed for the rest of the batch, so one outage costs one call per
//! address, not one per event.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use warden_schema::{
    AuditEntry, BlockState, FirewallAction, OffenseRecord, PendingIntent, ReasonCode,
};

use crate::exclusion::{parse_address, AddressError, ExclusionSet};
use crate::firewall::{dispatch, AdapterError, FirewallAdapter};
use crate::ledger::Ledger;
use crate::policy::{decide, Thresholds, Transition};

/// One access attempt read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    /// Source address as it appeared in the log; validated here.
    pub ip: String,
    pub ts_unix_sec: u64,
    /// Byte offset just past the log line this event came from.
    pub end_offset: u64,
}

impl AccessEvent {
    pub fn new(ip: impl Into<String>, ts_unix_sec: u64) -> Self {
        Self {
            ip: ip.into(),
            ts_unix_sec,
            end_offset: 0,
        }
    }

    pub fn at_offset(mut self, end_offset: u64) -> Self {
        self.end_offset = end_offset;
        self
    }
}

/// An event dropped because its address did not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEvent {
    pub ip: String,
    pub ts_unix_sec: u64,
    pub error: AddressError,
}

/// A firewall call that failed and was queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub ip: IpAddr,
    pub action: FirewallAction,
    pub error: AdapterError,
}

/// Result of processing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// State changes, per address in arrival order.
    pub audit: Vec<AuditEntry>,
    /// Firewall work that failed and must be retried.
    pub pending: Vec<PendingIntent>,
    pub skipped: Vec<SkippedEvent>,
    pub excluded: usize,
    pub adapter_failures: Vec<AdapterFailure>,
    /// Events applied to the ledger.
    pub processed: usize,
    /// True if the abort flag stopped processing early.
    pub aborted: bool,
}

impl ProcessOutcome {
    fn merge(&mut self, other: ProcessOutcome) {
        self.audit.extend(other.audit);
        self.pending.extend(other.pending);
        self.skipped.extend(other.skipped);
        self.excluded += other.excluded;
        self.adapter_failures.extend(other.adapter_failures);
        self.processed += other.processed;
        self.aborted |= other.aborted;
    }
}

/// Local effect of applying a transition to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Nothing,
    Audited(AuditEntry),
    Forget,
    /// Needs the adapter first; carries the attempt count that triggered it.
    Firewall(FirewallAction, u32),
}

fn audit_entry(
    record: &OffenseRecord,
    previous_state: BlockState,
    attempt_count: u32,
    reason: ReasonCode,
    ts_unix_sec: u64,
) -> AuditEntry {
    AuditEntry {
        ts_unix_sec,
        ip: record.ip,
        previous_state,
        new_state: record.state,
        attempt_count,
        reason,
        block_expires_at: record.block_expires_at,
    }
}

/// Apply the parts of `transition` that need no firewall call.
pub(crate) fn apply_transition(
    record: &mut OffenseRecord,
    transition: Transition,
    now: u64,
) -> Step {
    match transition {
        Transition::NoOp => Step::Nothing,
        Transition::Watch => {
            if record.state != BlockState::Clean {
                return Step::Nothing;
            }
            record.state = BlockState::Watched;
            Step::Audited(audit_entry(
                record,
                BlockState::Clean,
                record.attempt_count,
                ReasonCode::AttemptObserved,
                now,
            ))
        }
        Transition::ResetWindow { next_state } => {
            let previous = record.state;
            let count = record.attempt_count;
            record.reset_window(now);
            record.state = next_state;
            if previous == next_state {
                Step::Nothing
            } else {
                Step::Audited(audit_entry(record, previous, count, ReasonCode::WindowLapsed, now))
            }
        }
        Transition::Forget => Step::Forget,
        other => match other.firewall_action() {
            Some(action) => Step::Firewall(action, record.attempt_count),
            None => Step::Nothing,
        },
    }
}

/// True if `action` still moves `record` forward.
pub(crate) fn action_applies(record: &OffenseRecord, action: FirewallAction) -> bool {
    match action {
        FirewallAction::TemporaryBlock { .. } => !record.state.is_blocked(),
        FirewallAction::PermanentBlock => record.state != BlockState::PermanentlyBlocked,
        FirewallAction::Unblock => record.state == BlockState::TemporarilyBlocked,
    }
}

/// Advance `record` after the adapter confirmed `action`.
///
/// `policy_now` restarts the window on unblock; `anchor` is the
/// confirmation time temporary blocks count from.
pub(crate) fn commit(
    record: &mut OffenseRecord,
    action: FirewallAction,
    attempt_count: u32,
    policy_now: u64,
    anchor: u64,
) -> Option<AuditEntry> {
    if !action_applies(record, action) {
        return None;
    }

    let previous = record.state;
    let reason = match action {
        FirewallAction::TemporaryBlock { duration_secs } => {
            record.state = BlockState::TemporarilyBlocked;
            record.block_expires_at = Some(anchor.saturating_add(duration_secs));
            record.block_count = record.block_count.saturating_add(1);
            ReasonCode::AttemptLimitReached
        }
        FirewallAction::PermanentBlock => {
            record.state = BlockState::PermanentlyBlocked;
            record.block_expires_at = None;
            ReasonCode::RepeatOffender
        }
        FirewallAction::Unblock => {
            record.state = BlockState::Watched;
            record.block_expires_at = None;
            record.reset_window(policy_now);
            ReasonCode::BlockExpired
        }
    };

    Some(audit_entry(record, previous, attempt_count, reason, anchor))
}

/// Call the adapter and, on success, commit the record.
pub(crate) fn confirm(
    ledger: &Ledger,
    adapter: &dyn FirewallAdapter,
    ip: IpAddr,
    action: FirewallAction,
    attempt_count: u32,
    policy_now: u64,
    clock_now: u64,
) -> Result<Option<AuditEntry>, AdapterError> {
    dispatch(adapter, ip, action)?;
    let anchor = policy_now.max(clock_now);
    Ok(ledger
        .modify(ip, |record| commit(record, action, attempt_count, policy_now, anchor))
        .flatten())
}

/// Applies event batches to a ledger.
pub struct EventProcessor<'a> {
    ledger: &'a Ledger,
    exclusions: &'a ExclusionSet,
    thresholds: &'a Thresholds,
    adapter: &'a dyn FirewallAdapter,
    clock_now: u64,
    suppressed: HashSet<IpAddr>,
    abort: Option<&'a AtomicBool>,
}

impl<'a> EventProcessor<'a> {
    pub fn new(
        ledger: &'a Ledger,
        exclusions: &'a ExclusionSet,
        thresholds: &'a Thresholds,
        adapter: &'a dyn FirewallAdapter,
        clock_now: u64,
    ) -> Self {
        Self {
            ledger,
            exclusions,
            thresholds,
            adapter,
            clock_now,
            suppressed: HashSet::new(),
            abort: None,
        }
    }

    /// Addresses with firewall work already queued; no new calls are made for them.
    pub fn with_suppressed(mut self, suppressed: HashSet<IpAddr>) -> Self {
        self.suppressed = suppressed;
        self
    }

    /// Stop between events once `flag` is set.
    pub fn with_abort(mut self, flag: Option<&'a AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    fn aborted(&self) -> bool {
        self.abort.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Process `events`. Malformed addresses are skipped; the batch continues.
    pub fn process(&self, events: &[AccessEvent]) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        let mut order: Vec<IpAddr> = Vec::new();
        let mut groups: HashMap<IpAddr, Vec<&AccessEvent>> = HashMap::new();

        for event in events {
            match parse_address(&event.ip) {
                Err(error) => outcome.skipped.push(SkippedEvent {
                    ip: event.ip.clone(),
                    ts_unix_sec: event.ts_unix_sec,
                    error,
                }),
                Ok(ip) if self.exclusions.contains(ip) => outcome.excluded += 1,
                Ok(ip) => groups
                    .entry(ip)
                    .or_insert_with(|| {
                        order.push(ip);
                        Vec::new()
                    })
                    .push(event),
            }
        }

        let results: Vec<ProcessOutcome> = order
            .par_iter()
            .map(|ip| self.process_address(*ip, &groups[ip]))
            .collect();

        for result in results {
            outcome.merge(result);
        }
        outcome
    }

    fn process_address(&self, ip: IpAddr, events: &[&AccessEvent]) -> ProcessOutcome {
        let mut out = ProcessOutcome::default();
        let mut suppressed = self.suppressed.contains(&ip);
        let thresholds = self.thresholds;

        for event in events {
            if self.aborted() {
                out.aborted = true;
                break;
            }
            let ts = event.ts_unix_sec;

            // Settle expiry and window lapse at the event's own time first.
            let settled = self.ledger.with_record(ip, ts, |record| {
                let transition = decide(record, ts, thresholds);
                match transition {
                    Transition::Forget => {
                        record.reset_window(ts);
                        Step::Nothing
                    }
                    Transition::ResetWindow { .. } | Transition::ExpireBlock => {
                        apply_transition(record, transition, ts)
                    }
                    Transition::PermanentBlock
                        if record.state == BlockState::TemporarilyBlocked =>
                    {
                        apply_transition(record, transition, ts)
                    }
                    _ => Step::Nothing,
                }
            });
            self.handle_step(ip, settled, ts, &mut suppressed, &mut out);

            let counted = self.ledger.with_record(ip, ts, |record| {
                if record.state.is_blocked() {
                    return Step::Nothing;
                }
                record.record_attempt(ts);
                let transition = decide(record, ts, thresholds);
                apply_transition(record, transition, ts)
            });
            self.handle_step(ip, counted, ts, &mut suppressed, &mut out);

            out.processed += 1;
        }
        out
    }

    fn handle_step(
        &self,
        ip: IpAddr,
        step: Step,
        policy_now: u64,
        suppressed: &mut bool,
        out: &mut ProcessOutcome,
    ) {
        match step {
            Step::Nothing | Step::Forget => {}
            Step::Audited(entry) => out.audit.push(entry),
            Step::Firewall(_, _) if *suppressed => {}
            Step::Firewall(action, attempt_count) => {
                match confirm(
                    self.ledger,
                    self.adapter,
                    ip,
                    action,
                    attempt_count,
                    policy_now,
                    self.clock_now,
                ) {
                    Ok(entry) => out.audit.extend(entry),
                    Err(error) => {
                        *suppressed = true;
                        out.pending.push(PendingIntent {
                            ip,
                            action,
                            attempt_count,
                            queued_at: self.clock_now,
                            failures: 1,
                        });
                        out.adapter_failures.push(AdapterFailure { ip, action, error });
                    }
                }
            }
        }
    }
}

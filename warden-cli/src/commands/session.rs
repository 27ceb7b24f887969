//! The engine together with the files it reads and writes.
//!
//! Opened once per process by `run` and `once`; each `cycle` call reads the
//! new log lines, runs one engine cycle and reports what happened.

use std::sync::atomic::AtomicBool;

use warden_clock::{format_unix_sec, Clock};
use warden_engine::{
    AuditLog, CycleReport, Engine, EventBatch, ExclusionSet, FirewallAdapter, StateStore,
};
use warden_fs::Filesystem;

use crate::cli::CycleConfig;
use crate::commands::{CommandError, CommandResult};
use crate::io::{load_exclusions, LogReader, StatusLine, StatusWriter};
use crate::logger::Logger;

/// What to do when the firewall log cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnLogError {
    /// Fail the command.
    Fail,
    /// Log it and run the cycle with no new events.
    Continue,
}

pub struct Session<F: Filesystem + Clone> {
    engine: Engine,
    reader: LogReader<F>,
    store: StateStore<F>,
    audit: AuditLog<F>,
    status: Option<StatusWriter<F>>,
}

impl<F: Filesystem + Clone> Session<F> {
    /// Load exclusions and saved state.
    ///
    /// Bad exclusion entries and a corrupt state file are logged, not fatal.
    pub fn open<L: Logger>(config: &CycleConfig, fs: &F, logger: &L) -> CommandResult<Self> {
        let exclusions = match &config.exclusion_file {
            Some(path) => {
                let loaded = load_exclusions(fs, path)?;
                for rejected in &loaded.rejected {
                    logger.info(&format!(
                        "{}:{}: skipping exclusion entry: {}",
                        path.display(),
                        rejected.line,
                        rejected.error
                    ));
                }
                loaded.set
            }
            None => ExclusionSet::empty(),
        };

        let store = StateStore::new(fs.clone(), config.state_file.clone());
        let (engine, discarded) = Engine::from_store(&store, config.thresholds, exclusions)?;
        if let Some(e) = discarded {
            logger.info(&format!(
                "{e}; starting with an empty ledger ({})",
                store.path().display()
            ));
        }

        let t = config.thresholds;
        logger.verbose(&format!(
            "attempt_limit={} window={}s block={}s permanent_after={} escalate_at={:?} exclusions={}",
            t.attempt_limit,
            t.window_secs,
            t.block_secs,
            t.permanent_after,
            t.escalate_at,
            engine.exclusions().len()
        ));
        logger.verbose(&format!(
            "loaded {} records and {} pending firewall actions from {}",
            engine.ledger().len(),
            engine.pending().len(),
            store.path().display()
        ));

        Ok(Self {
            engine,
            reader: LogReader::new(fs.clone(), config.log_file.clone(), config.count_accepts),
            store,
            audit: AuditLog::new(fs.clone(), config.audit_file.clone()),
            status: config
                .status_file
                .clone()
                .map(|path| StatusWriter::new(fs.clone(), path)),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Read new log lines and run one cycle over them.
    ///
    /// Returns `Interrupted` if `abort` was raised mid-cycle.
    pub fn cycle<L: Logger>(
        &mut self,
        adapter: &dyn FirewallAdapter,
        clock: &dyn Clock,
        abort: Option<&AtomicBool>,
        on_log_error: OnLogError,
        logger: &L,
    ) -> CommandResult<CycleReport> {
        let batch = match self.reader.read_batch(self.engine.cursor()) {
            Ok(read) => {
                logger.debug(&format!(
                    "read {} lines from {} ({} unparsed, {} uncounted accepts)",
                    read.lines,
                    self.reader.path().display(),
                    read.unparsed,
                    read.uncounted
                ));
                if read.backlog {
                    logger.verbose(&format!(
                        "{} has more than one batch of new lines; reading the rest next cycle",
                        self.reader.path().display()
                    ));
                }
                if read.batch.rewound {
                    logger.verbose(&format!(
                        "{} shrank; reading from the start",
                        self.reader.path().display()
                    ));
                }
                read.batch
            }
            Err(e) if on_log_error == OnLogError::Continue => {
                logger.info(&format!("{e}; running the cycle without new events"));
                self.unchanged_batch()
            }
            Err(e) => return Err(e.into()),
        };

        let report =
            self.engine
                .run_cycle(batch, adapter, clock, &self.store, &self.audit, abort)?;
        if report.aborted {
            return Err(CommandError::Interrupted);
        }

        log_report(&report, logger);

        if let Some(status) = &self.status {
            if let Err(e) = status.append(&StatusLine::from_report(&report)) {
                logger.info(&e.to_string());
            }
        }

        Ok(report)
    }

    /// Empty batch that leaves the cursor where it is.
    fn unchanged_batch(&self) -> EventBatch {
        match self.engine.cursor() {
            Some(cursor) => EventBatch::new(cursor.file_id, Vec::new(), cursor.offset),
            None => EventBatch::new(0, Vec::new(), 0),
        }
    }
}

fn log_report<L: Logger>(report: &CycleReport, logger: &L) {
    for skipped in &report.skipped {
        logger.verbose(&format!(
            "skipped event at {}: {}",
            format_unix_sec(skipped.ts_unix_sec),
            skipped.error
        ));
    }

    for entry in &report.audit {
        let until = entry
            .block_expires_at
            .map(|ts| format!(" until {}", format_unix_sec(ts)))
            .unwrap_or_default();
        logger.verbose(&format!(
            "{}: {} -> {} ({}, {} attempts){until}",
            entry.ip, entry.previous_state, entry.new_state, entry.reason, entry.attempt_count
        ));
    }

    for failure in &report.adapter_failures {
        logger.info(&format!(
            "{} for {} failed: {}; queued for retry",
            failure.action, failure.ip, failure.error
        ));
    }

    if report.stale_intents > 0 {
        logger.debug(&format!(
            "dropped {} queued firewall actions that no longer apply",
            report.stale_intents
        ));
    }

    for error in &report.persistence_errors {
        logger.info(&format!("{error}; keeping changes in memory"));
    }

    if report.degraded() {
        logger.info(&format!(
            "cycle {} degraded: {} firewall actions pending, {} audit entries unsaved",
            report.cycle, report.pending, report.unsaved_audit
        ));
    }

    logger.verbose(&format!(
        "cycle {}: events={} replayed={} skipped={} excluded={} transitions={} retried={} stale={} forgotten={} pending={}",
        report.cycle,
        report.events,
        report.replayed,
        report.skipped.len(),
        report.excluded,
        report.audit.len(),
        report.retried,
        report.stale_intents,
        report.forgotten,
        report.pending
    ));
}

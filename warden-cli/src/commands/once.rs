//! `warden once`: a single cycle, for cron-style use.

use warden_clock::Clock;
use warden_engine::{CycleReport, FirewallAdapter};
use warden_fs::Filesystem;

use crate::cli::CycleConfig;
use crate::commands::session::{OnLogError, Session};
use crate::commands::CommandResult;
use crate::logger::Logger;
use crate::signal::ShutdownCheck;

/// Result of the once command.
#[derive(Debug)]
pub struct OnceResult {
    pub report: CycleReport,
    /// Records in the ledger after the cycle.
    pub tracked: usize,
}

/// Run one cycle. An unreadable firewall log fails the command.
pub fn execute_once<F, C, S, L>(
    config: &CycleConfig,
    fs: &F,
    adapter: &dyn FirewallAdapter,
    clock: &C,
    shutdown: &S,
    logger: &L,
) -> CommandResult<OnceResult>
where
    F: Filesystem + Clone,
    C: Clock,
    S: ShutdownCheck,
    L: Logger,
{
    let mut session = Session::open(config, fs, logger)?;
    let report = session.cycle(
        adapter,
        clock,
        shutdown.abort_flag(),
        OnLogError::Fail,
        logger,
    )?;

    Ok(OnceResult {
        tracked: session.engine().ledger().len(),
        report,
    })
}

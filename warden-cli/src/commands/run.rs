//! `warden run`: cycle every interval until SIGINT.

use warden_clock::Clock;
use warden_engine::FirewallAdapter;
use warden_fs::Filesystem;

use crate::cli::CycleConfig;
use crate::commands::session::{OnLogError, Session};
use crate::commands::CommandResult;
use crate::logger::Logger;
use crate::signal::ShutdownCheck;
use crate::sleeper::Sleeper;

/// Result of the run command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub cycles: u64,
    pub degraded_cycles: u64,
    /// Firewall actions still queued at shutdown.
    pub pending: usize,
}

/// Loop until `shutdown` fires.
///
/// The interval sleep is taken one second at a time so a shutdown request
/// is noticed promptly. An unreadable firewall log degrades a cycle but
/// does not stop the loop.
#[allow(clippy::too_many_arguments)]
pub fn execute_run<F, C, Z, S, L>(
    config: &CycleConfig,
    interval_sec: u64,
    fs: &F,
    adapter: &dyn FirewallAdapter,
    clock: &C,
    sleeper: &Z,
    shutdown: &S,
    logger: &L,
) -> CommandResult<RunResult>
where
    F: Filesystem + Clone,
    C: Clock,
    Z: Sleeper,
    S: ShutdownCheck,
    L: Logger,
{
    let mut session = Session::open(config, fs, logger)?;
    logger.info(&format!(
        "watching {} every {}s",
        config.log_file.display(),
        interval_sec
    ));

    let mut cycles = 0;
    let mut degraded_cycles = 0;

    'cycles: loop {
        if shutdown.should_stop() {
            break;
        }

        let report = session.cycle(
            adapter,
            clock,
            shutdown.abort_flag(),
            OnLogError::Continue,
            logger,
        )?;
        cycles += 1;
        if report.degraded() {
            degraded_cycles += 1;
        }

        for _ in 0..interval_sec {
            if shutdown.should_stop() {
                break 'cycles;
            }
            sleeper.sleep_sec(1);
        }
    }

    let pending = session.engine().pending().len();
    logger.info(&format!(
        "shutting down after {cycles} cycles ({degraded_cycles} degraded, {pending} firewall actions pending)"
    ));

    Ok(RunResult {
        cycles,
        degraded_cycles,
        pending,
    })
}

//! Firewall Warden binary.
//!
//! Entry point for the `warden` command-line tool.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use warden_cli::exit::{codes, exit_code};
use warden_cli::{
    execute_once, execute_run, execute_status, Cli, Command, CommandError, Logger, OnceArgs,
    RealSleeper, RunArgs, ShutdownFlag, StatusArgs, StderrLogger, Verbosity,
};
use warden_clock::SystemClock;
use warden_fs::{DeadlineFilesystem, RealFilesystem};
use warden_proxmox::ProxmoxFirewall;

/// Upper bound on any single state, audit or log file operation.
const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logger = StderrLogger::new(Verbosity::from_count(cli.verbose));

    // Set up shutdown handler for graceful termination on Ctrl+C
    let shutdown = ShutdownFlag::new();

    let result = match cli.command {
        Command::Run(args) => run_run(args, &shutdown, &logger),
        Command::Once(args) => run_once(args, &shutdown, &logger),
        Command::Status(args) => run_status(args),
    };

    match result {
        Ok(()) => ExitCode::from(codes::SUCCESS as u8),
        Err(e) => {
            logger.info(&format!("error: {e}"));
            ExitCode::from(exit_code(&e) as u8)
        }
    }
}

fn storage() -> DeadlineFilesystem<RealFilesystem> {
    DeadlineFilesystem::new(RealFilesystem, STORAGE_TIMEOUT)
}

/// Run the run command.
fn run_run(
    args: RunArgs,
    shutdown: &ShutdownFlag,
    logger: &StderrLogger,
) -> Result<(), CommandError> {
    args.validate()?;
    let firewall = ProxmoxFirewall::new(args.engine.proxmox_config()?)?;

    let result = execute_run(
        &args.engine.cycle_config(),
        args.interval_sec,
        &storage(),
        &firewall,
        &SystemClock,
        &RealSleeper,
        shutdown,
        logger,
    )?;

    println!(
        "Ran {} cycles ({} degraded), {} firewall actions pending",
        result.cycles, result.degraded_cycles, result.pending
    );
    Ok(())
}

/// Run the once command.
fn run_once(
    args: OnceArgs,
    shutdown: &ShutdownFlag,
    logger: &StderrLogger,
) -> Result<(), CommandError> {
    args.validate()?;
    let firewall = ProxmoxFirewall::new(args.engine.proxmox_config()?)?;

    let result = execute_once(
        &args.engine.cycle_config(),
        &storage(),
        &firewall,
        &SystemClock,
        shutdown,
        logger,
    )?;

    let report = &result.report;
    println!(
        "Processed {} events ({} skipped, {} excluded): {} transitions, {} addresses tracked, {} firewall actions pending",
        report.events,
        report.skipped.len(),
        report.excluded,
        report.audit.len(),
        result.tracked,
        report.pending
    );
    Ok(())
}

/// Run the status command.
fn run_status(args: StatusArgs) -> Result<(), CommandError> {
    let stdout = std::io::stdout();
    execute_status(&args, storage(), &SystemClock, &mut stdout.lock())?;
    Ok(())
}

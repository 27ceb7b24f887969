//! Firewall Warden CLI.
//!
//! Wires the engine to its surroundings: argument parsing and validation,
//! the firewall log reader, the exclusion file, the status heartbeat and
//! the `run`, `once` and `status` commands.

pub mod cli;
pub mod commands;
pub mod exit;
pub mod io;
pub mod logger;
pub mod signal;
pub mod sleeper;

pub use cli::{
    parse_from, Cli, CliError, Command, CycleConfig, EngineArgs, EscalateAt, OnceArgs, RunArgs,
    StatusArgs, DEFAULT_AUDIT_FILE, DEFAULT_INTERVAL_SEC, DEFAULT_LOG_FILE, DEFAULT_STATE_FILE,
};
pub use commands::{
    execute_once, execute_run, execute_status, CommandError, CommandResult, OnceResult, RunResult,
};
pub use logger::{Logger, MockLogger, NullLogger, StderrLogger, Verbosity};
pub use signal::{AlwaysShutdown, NeverShutdown, ShutdownCheck, ShutdownFlag};
pub use sleeper::{MockSleeper, RealSleeper, Sleeper};

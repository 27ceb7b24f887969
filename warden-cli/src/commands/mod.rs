//! Command orchestration for CLI subcommands.
//!
//! - `run` - cycle every interval until SIGINT
//! - `once` - a single cycle
//! - `status` - print the saved ledger

pub mod once;
pub mod run;
pub mod session;
pub mod status;

pub use once::{execute_once, OnceResult};
pub use run::{execute_run, RunResult};
pub use session::Session;
pub use status::{execute_status, StatusResult};

use thiserror::Error;
use warden_engine::{CycleError, StateError};
use warden_proxmox::ProxmoxError;

use crate::cli::CliError;
use crate::io::{ExclusionLoadError, LogReadError};

/// Errors from command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] CliError),

    #[error("{0}")]
    State(#[from] StateError),

    #[error("{0}")]
    Engine(#[from] CycleError),

    #[error("firewall error: {0}")]
    Firewall(#[from] ProxmoxError),

    #[error("{0}")]
    Exclusion(#[from] ExclusionLoadError),

    #[error("{0}")]
    LogSource(#[from] LogReadError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("interrupted mid-cycle; nothing from that cycle was saved")]
    Interrupted,
}

/// Result of command execution.
pub type CommandResult<T> = Result<T, CommandError>;

//! Exit codes for the warden binary.

use warden_engine::CycleError;

use crate::commands::CommandError;

/// Exit code constants.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_ARGS: i32 = 1;
    pub const IO_ERROR: i32 = 2;
    /// State file unreadable or unusable.
    pub const STATE_ERROR: i32 = 3;
    /// Firewall client could not be set up.
    pub const FIREWALL_ERROR: i32 = 4;
    pub const EXCLUSION_ERROR: i32 = 5;
    /// Firewall log unreadable.
    pub const LOG_SOURCE_ERROR: i32 = 6;
    /// Interrupted by signal (128 + SIGINT).
    pub const SIGINT: i32 = 130;
}

/// Map a CommandError to an exit code.
pub fn exit_code(error: &CommandError) -> i32 {
    match error {
        CommandError::InvalidArgument(_) => codes::INVALID_ARGS,
        CommandError::State(_) => codes::STATE_ERROR,
        CommandError::Engine(CycleError::Thresholds(_)) => codes::INVALID_ARGS,
        CommandError::Engine(CycleError::Aborted) => codes::SIGINT,
        CommandError::Engine(_) => codes::STATE_ERROR,
        CommandError::Firewall(_) => codes::FIREWALL_ERROR,
        CommandError::Exclusion(_) => codes::EXCLUSION_ERROR,
        CommandError::LogSource(_) => codes::LOG_SOURCE_ERROR,
        CommandError::Output(_) => codes::IO_ERROR,
        CommandError::Interrupted => codes::SIGINT,
    }
}

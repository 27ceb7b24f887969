//! CLI argument parsing for Firewall Warden.
//!
//! Every option can also come from a `WARDEN_*` environment variable.
//! Arguments are validated once and turned into the typed configs the
//! commands take: `Thresholds`, `ProxmoxConfig` and `CycleConfig`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use warden_engine::{EscalationPoint, ThresholdError, Thresholds};
use warden_proxmox::{ConfigError, ProxmoxConfig, DEFAULT_NODE};

/// Default Proxmox firewall log.
pub const DEFAULT_LOG_FILE: &str = "/var/log/pve-firewall.log";

/// Default state file.
pub const DEFAULT_STATE_FILE: &str = "./warden_state.json";

/// Default audit log.
pub const DEFAULT_AUDIT_FILE: &str = "./warden_audit.jsonl";

pub const DEFAULT_ATTEMPT_LIMIT: u32 = 5;
pub const DEFAULT_WINDOW_SEC: u64 = 300;
pub const DEFAULT_BLOCK_SEC: u64 = 3600;
pub const DEFAULT_PERMANENT_AFTER: u32 = 3;

/// Default pause between cycles for `run`.
pub const DEFAULT_INTERVAL_SEC: u64 = 60;

/// Default Proxmox request timeout.
pub const DEFAULT_TIMEOUT_SEC: u64 = 10;

/// Errors from CLI argument validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("{0}")]
    InvalidThresholds(#[from] ThresholdError),

    #[error("{0}")]
    InvalidProxmox(#[from] ConfigError),

    #[error("--{0} is required (or set {1})")]
    MissingSetting(&'static str, &'static str),

    #[error("interval-sec must be at least 1, got {0}")]
    InvalidIntervalSec(u64),

    #[error("timeout-sec must be at least 1, got {0}")]
    InvalidTimeoutSec(u64),
}

/// Firewall Warden - blocks repeat offenders seen in the Proxmox firewall log.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a cycle every --interval-sec until interrupted.
    Run(RunArgs),
    /// Run a single cycle and exit.
    Once(OnceArgs),
    /// Print the offense ledger from the state file.
    Status(StatusArgs),
}

/// When a released address goes permanent.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscalateAt {
    /// On the first qualifying burst after the last temporary block.
    #[default]
    NextBurst,
    /// As soon as the last temporary block expires.
    AtExpiry,
}

impl From<EscalateAt> for EscalationPoint {
    fn from(value: EscalateAt) -> Self {
        match value {
            EscalateAt::NextBurst => EscalationPoint::NextBurst,
            EscalateAt::AtExpiry => EscalationPoint::AtExpiry,
        }
    }
}

/// Options shared by every command that runs cycles.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct EngineArgs {
    /// Proxmox firewall log to follow.
    #[arg(long, env = "WARDEN_LOG_FILE", default_value = DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,

    /// Ledger, log position and queued firewall work.
    #[arg(long, env = "WARDEN_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,

    /// Append-only audit trail (one JSON object per line).
    #[arg(long, env = "WARDEN_AUDIT_FILE", default_value = DEFAULT_AUDIT_FILE)]
    pub audit_file: PathBuf,

    /// Append a JSON heartbeat line here after every cycle.
    #[arg(long, env = "WARDEN_STATUS_FILE")]
    pub status_file: Option<PathBuf>,

    /// Addresses and ranges that are never tracked (one per line).
    #[arg(long, env = "WARDEN_EXCLUSION_FILE")]
    pub exclusion_file: Option<PathBuf>,

    /// Proxmox node whose firewall receives the rules.
    #[arg(long, env = "WARDEN_NODE", default_value = DEFAULT_NODE)]
    pub node: String,

    /// Proxmox API base URL, e.g. https://pve01:8006.
    #[arg(long, env = "WARDEN_API_URL")]
    pub api_url: Option<String>,

    /// Proxmox API user including realm, e.g. root@pam.
    #[arg(long, env = "WARDEN_API_USER")]
    pub api_user: Option<String>,

    #[arg(long, env = "WARDEN_API_PASSWORD", hide_env_values = true)]
    pub api_password: Option<String>,

    /// Reject self-signed API certificates.
    #[arg(long, env = "WARDEN_VERIFY_TLS")]
    pub verify_tls: bool,

    /// Attempts inside one window that trigger a block.
    #[arg(long, env = "WARDEN_ATTEMPT_LIMIT", default_value_t = DEFAULT_ATTEMPT_LIMIT)]
    pub attempt_limit: u32,

    /// Length of the attempt-counting window in seconds.
    #[arg(long, env = "WARDEN_WINDOW_SEC", default_value_t = DEFAULT_WINDOW_SEC)]
    pub window_sec: u64,

    /// Length of a temporary block in seconds.
    #[arg(long, env = "WARDEN_BLOCK_SEC", default_value_t = DEFAULT_BLOCK_SEC)]
    pub block_sec: u64,

    /// Temporary blocks served before the next one is permanent.
    #[arg(long, env = "WARDEN_PERMANENT_AFTER", default_value_t = DEFAULT_PERMANENT_AFTER)]
    pub permanent_after: u32,

    #[arg(long, env = "WARDEN_ESCALATE_AT", value_enum, default_value_t = EscalateAt::NextBurst)]
    pub escalate_at: EscalateAt,

    /// Count ACCEPT lines as attempts too, not only DROP.
    #[arg(long, env = "WARDEN_COUNT_ACCEPTS")]
    pub count_accepts: bool,

    /// Timeout for each Proxmox API request in seconds.
    #[arg(long, env = "WARDEN_TIMEOUT_SEC", default_value_t = DEFAULT_TIMEOUT_SEC)]
    pub timeout_sec: u64,
}

impl EngineArgs {
    /// Validate the arguments, including the Proxmox connection settings.
    pub fn validate(&self) -> Result<(), CliError> {
        self.thresholds().validate()?;
        if self.timeout_sec == 0 {
            return Err(CliError::InvalidTimeoutSec(self.timeout_sec));
        }
        self.proxmox_config()?.validate()?;
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(
            self.attempt_limit,
            self.window_sec,
            self.block_sec,
            self.permanent_after,
        )
        .with_escalation_point(self.escalate_at.into())
    }

    /// Proxmox settings. Fails if any credential is missing.
    pub fn proxmox_config(&self) -> Result<ProxmoxConfig, CliError> {
        let api_url = self
            .api_url
            .as_deref()
            .ok_or(CliError::MissingSetting("api-url", "WARDEN_API_URL"))?;
        let user = self
            .api_user
            .as_deref()
            .ok_or(CliError::MissingSetting("api-user", "WARDEN_API_USER"))?;
        let password = self
            .api_password
            .as_deref()
            .ok_or(CliError::MissingSetting("api-password", "WARDEN_API_PASSWORD"))?;

        Ok(ProxmoxConfig::new(api_url, user, password)
            .with_node(self.node.as_str())
            .with_verify_tls(self.verify_tls)
            .with_timeout(Duration::from_secs(self.timeout_sec)))
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            log_file: self.log_file.clone(),
            state_file: self.state_file.clone(),
            audit_file: self.audit_file.clone(),
            status_file: self.status_file.clone(),
            exclusion_file: self.exclusion_file.clone(),
            count_accepts: self.count_accepts,
            thresholds: self.thresholds(),
        }
    }
}

/// Arguments for the run command.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Seconds to wait between cycles.
    #[arg(long, env = "WARDEN_INTERVAL_SEC", default_value_t = DEFAULT_INTERVAL_SEC)]
    pub interval_sec: u64,
}

impl RunArgs {
    pub fn validate(&self) -> Result<(), CliError> {
        if self.interval_sec == 0 {
            return Err(CliError::InvalidIntervalSec(self.interval_sec));
        }
        self.engine.validate()
    }
}

/// Arguments for the once command.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct OnceArgs {
    #[command(flatten)]
    pub engine: EngineArgs,
}

impl OnceArgs {
    pub fn validate(&self) -> Result<(), CliError> {
        self.engine.validate()
    }
}

/// Arguments for the status command.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct StatusArgs {
    #[arg(long, env = "WARDEN_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,

    /// Print the raw state file instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Everything one cycle needs besides the firewall and the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleConfig {
    pub log_file: PathBuf,
    pub state_file: PathBuf,
    pub audit_file: PathBuf,
    pub status_file: Option<PathBuf>,
    pub exclusion_file: Option<PathBuf>,
    pub count_accepts: bool,
    pub thresholds: Thresholds,
}

/// Parse CLI arguments from an iterator of strings.
/// Useful for testing.
pub fn parse_from<I, T>(iter: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(iter)
}

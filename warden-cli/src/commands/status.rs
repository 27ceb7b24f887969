//! `warden status`: print the saved ledger without touching the firewall.

use std::io::Write;

use warden_clock::{format_unix_sec, Clock};
use warden_engine::{BlockState, StateStore};
use warden_fs::Filesystem;

use crate::cli::StatusArgs;
use crate::commands::CommandResult;

/// Result of the status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    /// False if there is no state file yet.
    pub found: bool,
    pub records: usize,
    pub blocked: usize,
    pub pending: usize,
}

/// Print the state file at `args.state_file` to `out`.
///
/// A corrupt state file is an error here; only the cycle commands discard
/// it and start over.
pub fn execute_status<F, C, W>(
    args: &StatusArgs,
    fs: F,
    clock: &C,
    out: &mut W,
) -> CommandResult<StatusResult>
where
    F: Filesystem,
    C: Clock,
    W: Write,
{
    let store = StateStore::new(fs, args.state_file.clone());
    let Some(state) = store.load()? else {
        writeln!(out, "no state file at {}", args.state_file.display())?;
        return Ok(StatusResult {
            found: false,
            records: 0,
            blocked: 0,
            pending: 0,
        });
    };

    let blocked = state
        .records
        .values()
        .filter(|record| record.state.is_blocked())
        .count();
    let result = StatusResult {
        found: true,
        records: state.records.len(),
        blocked,
        pending: state.pending.len(),
    };

    if args.json {
        writeln!(out, "{}", state.to_json())?;
        return Ok(result);
    }

    let now = clock.now_unix_sec();
    writeln!(
        out,
        "{:<40} {:<20} {:>8} {:>6}  {:<25} EXPIRES",
        "ADDRESS", "STATE", "ATTEMPTS", "BLOCKS", "LAST SEEN"
    )?;
    for (ip, record) in &state.records {
        let expires = match (record.state, record.block_expires_at) {
            (BlockState::PermanentlyBlocked, _) => "never".to_string(),
            (_, Some(ts)) if ts <= now => format!("{} (due)", format_unix_sec(ts)),
            (_, Some(ts)) => format_unix_sec(ts),
            (_, None) => "-".to_string(),
        };
        writeln!(
            out,
            "{:<40} {:<20} {:>8} {:>6}  {:<25} {}",
            ip,
            record.state.as_str(),
            record.attempt_count,
            record.block_count,
            format_unix_sec(record.last_seen),
            expires
        )?;
    }

    for intent in &state.pending {
        writeln!(
            out,
            "pending: {} for {} (queued {}, {} failures)",
            intent.action,
            intent.ip,
            format_unix_sec(intent.queued_at),
            intent.failures
        )?;
    }

    match state.cursor {
        Some(cursor) => writeln!(
            out,
            "{} tracked, {} blocked; log position {} in file {}",
            result.records, result.blocked, cursor.offset, cursor.file_id
        )?,
        None => writeln!(out, "{} tracked, {} blocked", result.records, result.blocked)?,
    }

    Ok(result)
}

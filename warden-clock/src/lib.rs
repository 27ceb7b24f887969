//! Clock abstraction for Firewall Warden.
//!
//! All engine time is Unix seconds. The engine never reads the wall clock
//! directly; it is handed a [`Clock`] so expiry and window logic can be
//! exercised in tests without waiting.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{TimeZone, Utc};

/// Source of the current Unix timestamp.
pub trait Clock: Send + Sync {
    /// Returns the current time as Unix seconds since epoch.
    fn now_unix_sec(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_unix_sec(&self) -> u64 {
        (**self).now_unix_sec()
    }
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_sec(&self) -> u64 {
        // Clamp pre-epoch clocks to zero rather than wrapping.
        Utc::now().timestamp().max(0) as u64
    }
}

/// Clock frozen at a single timestamp.
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    timestamp: u64,
}

impl MockClock {
    /// Create a mock clock with a fixed timestamp.
    pub fn new(timestamp: u64) -> Self {
        Self { timestamp }
    }
}

impl Clock for MockClock {
    fn now_unix_sec(&self) -> u64 {
        self.timestamp
    }
}

/// Clock moved explicitly by the test driving it.
///
/// Shared between threads; `advance` and `set` are visible to every
/// subsequent `now_unix_sec` call. Multi-cycle scenarios (block, wait out
/// the block, re-offend) use this to step time between cycles.
#[derive(Debug, Default)]
pub struct ManualClock {
    timestamp: AtomicU64,
}

impl ManualClock {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp: AtomicU64::new(timestamp),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.timestamp.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp.
    pub fn set(&self, timestamp: u64) {
        self.timestamp.store(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_sec(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }
}

/// Render a Unix timestamp as RFC 3339 for operator-facing output.
///
/// Times past what a calendar date can hold, such as expiries saturated
/// at `u64::MAX`, render as "never".
pub fn format_unix_sec(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}

//! Pause between cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub trait Sleeper: Send + Sync {
    fn sleep_sec(&self, seconds: u64);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealSleeper;

impl Sleeper for RealSleeper {
    fn sleep_sec(&self, seconds: u64) {
        std::thread::sleep(Duration::from_secs(seconds));
    }
}

/// Returns immediately and adds up the time it was asked to sleep.
#[derive(Debug, Default, Clone)]
pub struct MockSleeper {
    slept: Arc<AtomicU64>,
}

impl MockSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total seconds requested so far.
    pub fn total_slept(&self) -> u64 {
        self.slept.load(Ordering::SeqCst)
    }
}

impl Sleeper for MockSleeper {
    fn sleep_sec(&self, seconds: u64) {
        self.slept.fetch_add(seconds, Ordering::SeqCst);
    }
}

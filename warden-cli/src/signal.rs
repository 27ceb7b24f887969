//! SIGINT handling.
//!
//! `ShutdownFlag` is set by the ctrl-c handler. The run loop polls it
//! between cycles, and the engine polls the same flag between events so an
//! interrupt mid-cycle abandons the cycle instead of persisting half of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Polled by loops that should stop on request.
pub trait ShutdownCheck: Send + Sync {
    fn should_stop(&self) -> bool;

    /// Flag the engine can poll mid-cycle, if this check has one.
    fn abort_flag(&self) -> Option<&AtomicBool> {
        None
    }
}

/// Shutdown flag, optionally wired to SIGINT.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    /// Create a flag and register the ctrl-c handler.
    ///
    /// If a handler is already registered the flag still works when
    /// triggered by hand.
    pub fn new() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&flag);

        let _ = ctrlc::set_handler(move || {
            handler_flag.store(true, Ordering::SeqCst);
        });

        Self { flag }
    }

    /// Create a flag without a signal handler.
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl ShutdownCheck for ShutdownFlag {
    fn should_stop(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn abort_flag(&self) -> Option<&AtomicBool> {
        Some(&self.flag)
    }
}

/// Never signals shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverShutdown;

impl ShutdownCheck for NeverShutdown {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Always signals shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysShutdown;

impl ShutdownCheck for AlwaysShutdown {
    fn should_stop(&self) -> bool {
        true
    }
}

//! Firewall adapter seam.
//!
//! The engine only ever asks the firewall to add a block for an address or
//! remove it. Every failure is retryable: the caller queues the action and
//! does not advance the record until a later call succeeds.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use warden_schema::FirewallAction;

/// How long a block should hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDuration {
    Temporary { secs: u64 },
    Permanent,
}

/// Firewall adapter failures. All are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("firewall call timed out after {0:?}")]
    Timeout(Duration),

    #[error("firewall unavailable: {0}")]
    Unavailable(String),

    #[error("firewall rejected the request: {0}")]
    Rejected(String),
}

/// Control plane for the host firewall.
pub trait FirewallAdapter: Send + Sync {
    /// Block all inbound traffic from `ip`.
    fn block(&self, ip: IpAddr, duration: BlockDuration) -> Result<(), AdapterError>;

    /// Remove any block for `ip`. Unblocking an address with no block succeeds.
    fn unblock(&self, ip: IpAddr) -> Result<(), AdapterError>;
}

impl<A: FirewallAdapter + ?Sized> FirewallAdapter for &A {
    fn block(&self, ip: IpAddr, duration: BlockDuration) -> Result<(), AdapterError> {
        (**self).block(ip, duration)
    }

    fn unblock(&self, ip: IpAddr) -> Result<(), AdapterError> {
        (**self).unblock(ip)
    }
}

/// Execute a queued action against `adapter`.
pub(crate) fn dispatch(
    adapter: &dyn FirewallAdapter,
    ip: IpAddr,
    action: FirewallAction,
) -> Result<(), AdapterError> {
    match action {
        FirewallAction::TemporaryBlock { duration_secs } => adapter.block(
            ip,
            BlockDuration::Temporary {
                secs: duration_secs,
            },
        ),
        FirewallAction::PermanentBlock => adapter.block(ip, BlockDuration::Permanent),
        FirewallAction::Unblock => adapter.unblock(ip),
    }
}

/// A call the mock firewall received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCall {
    Block { ip: IpAddr, duration: BlockDuration },
    Unblock { ip: IpAddr },
}

/// Recording firewall for tests.
///
/// Cloning creates a new handle to the same call log. Failures are
/// scripted with `set_unavailable` (every call fails) or `fail_next`
/// (the next `n` calls fail).
#[derive(Debug, Clone, Default)]
pub struct MockFirewall {
    calls: Arc<Mutex<Vec<FirewallCall>>>,
    active: Arc<Mutex<Vec<IpAddr>>>,
    unavailable: Arc<AtomicBool>,
    fail_next: Arc<AtomicUsize>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Every call received, including failed ones.
    pub fn calls(&self) -> Vec<FirewallCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Addresses currently blocked, from successful calls.
    pub fn active_blocks(&self) -> Vec<IpAddr> {
        self.active.lock().clone()
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AdapterError::Timeout(Duration::from_secs(10)));
        }
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(AdapterError::Unavailable("scripted failure".to_string()));
        }
        Ok(())
    }
}

impl FirewallAdapter for MockFirewall {
    fn block(&self, ip: IpAddr, duration: BlockDuration) -> Result<(), AdapterError> {
        self.calls.lock().push(FirewallCall::Block { ip, duration });
        self.check()?;
        let mut active = self.active.lock();
        if !active.contains(&ip) {
            active.push(ip);
        }
        Ok(())
    }

    fn unblock(&self, ip: IpAddr) -> Result<(), AdapterError> {
        self.calls.lock().push(FirewallCall::Unblock { ip });
        self.check()?;
        self.active.lock().retain(|a| *a != ip);
        Ok(())
    }
}

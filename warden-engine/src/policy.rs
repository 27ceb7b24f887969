//! Escalation policy.
//!
//! `decide` is a pure function of a record, the current time and the
//! configured thresholds. It never touches the ledger or the firewall; the
//! processor applies whatever it returns.
//!
//! Rules, first match wins:
//! 1. permanently blocked → `NoOp` (terminal)
//! 2. temporarily blocked, not yet expired → `NoOp`
//! 3. temporarily blocked, expired → `ExpireBlock`
//!    (or `PermanentBlock` when escalating at expiry)
//! 4. window lapsed → `ResetWindow`, or `Forget` for idle records with no history
//! 5. attempt limit reached → `PermanentBlock` for repeat offenders, else `TemporaryBlock`
//! 6. otherwise → `Watch`

use thiserror::Error;
use warden_schema::{BlockState, FirewallAction, OffenseRecord};

/// When a repeat offender is made permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscalationPoint {
    /// On the first qualifying burst after a block has expired.
    #[default]
    NextBurst,
    /// As soon as the last allowed temporary block expires.
    AtExpiry,
}

/// Invalid threshold configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdError {
    #[error("attempt limit must be at least 1")]
    ZeroAttemptLimit,

    #[error("window duration must be at least 1 second")]
    ZeroWindow,

    #[error("block duration must be at least 1 second")]
    ZeroBlockDuration,
}

/// Escalation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Attempts inside one window that trigger a block.
    pub attempt_limit: u32,
    pub window_secs: u64,
    /// Length of a temporary block.
    pub block_secs: u64,
    /// Temporary blocks served before the next burst is permanent.
    pub permanent_after: u32,
    pub escalate_at: EscalationPoint,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            attempt_limit: 5,
            window_secs: 300,
            block_secs: 3600,
            permanent_after: 3,
            escalate_at: EscalationPoint::NextBurst,
        }
    }
}

impl Thresholds {
    pub fn new(attempt_limit: u32, window_secs: u64, block_secs: u64, permanent_after: u32) -> Self {
        Self {
            attempt_limit,
            window_secs,
            block_secs,
            permanent_after,
            escalate_at: EscalationPoint::NextBurst,
        }
    }

    pub fn with_escalation_point(mut self, point: EscalationPoint) -> Self {
        self.escalate_at = point;
        self
    }

    pub fn validate(&self) -> Result<(), ThresholdError> {
        if self.attempt_limit == 0 {
            return Err(ThresholdError::ZeroAttemptLimit);
        }
        if self.window_secs == 0 {
            return Err(ThresholdError::ZeroWindow);
        }
        if self.block_secs == 0 {
            return Err(ThresholdError::ZeroBlockDuration);
        }
        Ok(())
    }
}

/// Next lifecycle step for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    NoOp,
    /// Attempt recorded below the limit.
    Watch,
    /// Window lapsed without escalation; counting restarts.
    ResetWindow { next_state: BlockState },
    /// Idle record with no block history; drop it from the ledger.
    Forget,
    TemporaryBlock { duration_secs: u64, expires_at: u64 },
    PermanentBlock,
    /// Temporary block served; lift it.
    ExpireBlock,
}

impl Transition {
    /// Firewall call that must succeed before this transition is applied.
    pub fn firewall_action(self) -> Option<FirewallAction> {
        match self {
            Transition::TemporaryBlock { duration_secs, .. } => {
                Some(FirewallAction::TemporaryBlock { duration_secs })
            }
            Transition::PermanentBlock => Some(FirewallAction::PermanentBlock),
            Transition::ExpireBlock => Some(FirewallAction::Unblock),
            _ => None,
        }
    }

    pub fn needs_firewall(self) -> bool {
        self.firewall_action().is_some()
    }
}

/// Decide the next transition for `record` at time `now`.
pub fn decide(record: &OffenseRecord, now: u64, thresholds: &Thresholds) -> Transition {
    match record.state {
        BlockState::PermanentlyBlocked => Transition::NoOp,

        BlockState::TemporarilyBlocked => match record.block_expires_at {
            Some(expires_at) if now < expires_at => Transition::NoOp,
            _ => match thresholds.escalate_at {
                EscalationPoint::AtExpiry if record.block_count >= thresholds.permanent_after => {
                    Transition::PermanentBlock
                }
                _ => Transition::ExpireBlock,
            },
        },

        BlockState::Clean | BlockState::Watched => {
            if now.saturating_sub(record.first_seen) > thresholds.window_secs {
                if record.state == BlockState::Clean
                    && record.attempt_count == 0
                    && record.block_count == 0
                {
                    Transition::Forget
                } else if record.attempt_count > 0 {
                    Transition::ResetWindow {
                        next_state: BlockState::Watched,
                    }
                } else {
                    Transition::ResetWindow {
                        next_state: BlockState::Clean,
                    }
                }
            } else if record.attempt_count >= thresholds.attempt_limit {
                if record.block_count >= thresholds.permanent_after {
                    Transition::PermanentBlock
                } else {
                    Transition::TemporaryBlock {
                        duration_secs: thresholds.block_secs,
                        expires_at: now.saturating_add(thresholds.block_secs),
                    }
                }
            } else if record.attempt_count == 0 {
                // Nothing counted yet (fresh or just reset); stay as is.
                Transition::NoOp
            } else {
                Transition::Watch
            }
        }
    }
}

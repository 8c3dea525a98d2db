//! Reconciliation primitives for external module releases.
//!
//! Everything in this crate is pure: the controller fetches a snapshot from
//! the object store, hands it to these functions and applies the result.
//!
//! - **Predictor**: picks the current, desired and obsolete releases of a module.
//! - **Phase**: legal release phases and the transitions between them.
//! - **Window**: maintenance-window schedule for automatic updates.
//! - **Gate**: decides whether a desired release may be activated now.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - The predictor only ever proposes moving forward to a newer version
//! - At most one release per module is reported as current

use std::time::Duration;

pub mod gate;
pub mod phase;
pub mod predictor;
pub mod window;

pub use gate::{evaluate, is_approved, GateDecision, PolicyMode, PolicyRef};
pub use phase::{Phase, PhaseError, ReleaseStatus};
pub use predictor::{predict, Prediction};
pub use window::{Window, WindowError, Windows};

/// What a worker should do with a key after reconciling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; forget the key's failure history.
    Done,

    /// Retry with per-key exponential backoff.
    Requeue,

    /// Retry after a fixed delay (policy blocks, pull overrides).
    RequeueAfter(Duration),
}

impl Action {
    /// Returns true if the key should not be retried.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(1000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Fixed retry delay for policy-blocked releases and overridden modules.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Lowest weight an externally supplied module may declare.
pub const MIN_EXTERNAL_WEIGHT: u32 = 900;

/// Highest weight an externally supplied module may declare.
pub const MAX_EXTERNAL_WEIGHT: u32 = 999;

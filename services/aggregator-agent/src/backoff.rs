//! Restart backoff.
//!
//! Exponential backoff with reset on recovery. The policy is a pure function
//! of its inputs; [`BackoffState`] carries the per-service counters and is
//! only ever touched from the monitor loop.

use std::time::{Duration, Instant};

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after a reset, and the lower bound.
    pub floor: Duration,

    /// Maximum delay.
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(30),
            ceiling: Duration::from_secs(10 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Double `current`, clamped to `[floor, ceiling]`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).clamp(self.floor, self.ceiling)
    }

    /// Delay after recovery.
    pub fn reset(&self) -> Duration {
        self.floor
    }
}

/// Outcome of asking the backoff window whether an action may run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Outside the window; act now.
    Ready,
    /// Still inside the window.
    Wait { remaining: Duration },
}

/// Per-service restart counters.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: BackoffPolicy,
    current_delay: Duration,
    last_action: Option<Instant>,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current_delay: policy.floor,
            last_action: None,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn last_action(&self) -> Option<Instant> {
        self.last_action
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Check whether the window since the last action has elapsed.
    pub fn gate(&self, now: Instant) -> Gate {
        match self.last_action {
            None => Gate::Ready,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= self.current_delay {
                    Gate::Ready
                } else {
                    Gate::Wait {
                        remaining: self.current_delay - elapsed,
                    }
                }
            }
        }
    }

    /// Record an unhealthy-triggered action and grow the delay.
    ///
    /// Returns the delay that now guards the next action.
    pub fn record_action(&mut self, now: Instant) -> Duration {
        self.last_action = Some(now);
        self.current_delay = self.policy.next_delay(self.current_delay);
        self.current_delay
    }

    /// Reset after recovery. Returns true if the delay was above the floor.
    pub fn record_recovery(&mut self) -> bool {
        if self.current_delay > self.policy.floor {
            self.current_delay = self.policy.reset();
            true
        } else {
            false
        }
    }
}

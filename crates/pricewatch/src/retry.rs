//! Per-run retry state machine with capped exponential backoff.
//!
//! A run walks Pending → Attempting → (Retrying → Attempting)* →
//! Succeeded | Failed. The worker task drives the machine; there is no
//! recursion and no hidden scheduling inside it.

use std::time::Duration;

use crate::registry::RetryPolicy;
use crate::types::FetchStatus;

/// Where a run currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded,
    Failed { reason: String },
}

/// What the worker should do next after reporting an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Sleep for the backoff delay, then attempt again.
    RetryAfter(Duration),
    Done,
    GiveUp { reason: String },
}

/// Backoff for the given zero-based retry attempt: base × 2^attempt, capped.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.min(16);
    let secs = policy
        .base_delay_secs
        .saturating_mul(1u64 << exp)
        .min(policy.max_delay_secs);
    Duration::from_secs(secs)
}

/// Drives one run through its attempts.
pub struct RetryDriver {
    policy: RetryPolicy,
    state: RunState,
    attempts: u32,
}

impl RetryDriver {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RunState::Pending,
            attempts: 0,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Attempts made so far (initial attempt included).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Mark the start of an attempt.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.state = RunState::Attempting {
            attempt: self.attempts,
        };
    }

    /// Report the outcome of the current attempt and learn the next step.
    ///
    /// Transient outcomes retry with exponential backoff until the policy's
    /// retry budget is spent. A hard block never retries within the run.
    pub fn on_outcome(&mut self, status: FetchStatus) -> Step {
        match status {
            FetchStatus::Success => {
                self.state = RunState::Succeeded;
                Step::Done
            }
            FetchStatus::HardBlock => {
                let reason = "hard block: identity burned, no same-run retry".to_string();
                self.state = RunState::Failed {
                    reason: reason.clone(),
                };
                Step::GiveUp { reason }
            }
            FetchStatus::SoftBlock | FetchStatus::NetworkError | FetchStatus::Timeout => {
                let retries_used = self.attempts.saturating_sub(1);
                if retries_used >= self.policy.max_retries {
                    let reason = format!(
                        "{status} after {} attempts ({} retries)",
                        self.attempts, retries_used
                    );
                    self.state = RunState::Failed {
                        reason: reason.clone(),
                    };
                    Step::GiveUp { reason }
                } else {
                    let delay = backoff_delay(&self.policy, retries_used);
                    self.state = RunState::Retrying {
                        attempt: self.attempts,
                        delay,
                    };
                    Step::RetryAfter(delay)
                }
            }
        }
    }
}

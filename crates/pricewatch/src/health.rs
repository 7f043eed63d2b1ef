//! Per-target health tracking and the throttle state machine.
//!
//! Each target carries a bounded window of recent fetch outcomes. Block
//! pressure over the window drives Normal → Soft → Hard transitions; expiry
//! steps back down one level at a time, never jumping Hard → Normal. The
//! emitted advice is a function of the current state only (a Mealy machine):
//! the scheduler never sets throttle levels directly.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FetchStatus, Priority};

/// Throttle level of a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    Normal,
    Soft,
    Hard,
}

impl std::fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// Thresholds and cool-down durations for the throttle machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Observations kept per target.
    pub window_size: usize,
    /// Block ratio that escalates Normal → Soft.
    pub soft_block_ratio: f64,
    /// Block ratio that escalates Soft → Hard.
    pub hard_block_ratio: f64,
    /// Hard blocks within the window that force Hard regardless of ratio.
    pub hard_block_count: usize,
    /// Minutes before a Soft throttle may step back to Normal.
    pub soft_cooldown_minutes: i64,
    /// Minutes before a Hard throttle may step back to Soft.
    pub hard_cooldown_minutes: i64,
    /// Inter-request delay multiplier applied under Soft throttle.
    pub soft_delay_factor: f64,
    /// Delay multiplier applied to Urgent jobs that run under Hard throttle.
    pub hard_delay_factor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            soft_block_ratio: 0.2,
            hard_block_ratio: 0.5,
            hard_block_count: 2,
            soft_cooldown_minutes: 15,
            hard_cooldown_minutes: 60,
            soft_delay_factor: 2.0,
            hard_delay_factor: 3.0,
        }
    }
}

/// One recorded fetch outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub at: DateTime<Utc>,
    pub status: FetchStatus,
    pub latency_ms: u64,
}

/// Rolling health state of one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetHealth {
    pub target: String,
    #[serde(skip)]
    window: VecDeque<OutcomeSample>,
    pub level: ThrottleLevel,
    pub throttle_until: Option<DateTime<Utc>>,
}

impl TargetHealth {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            window: VecDeque::new(),
            level: ThrottleLevel::Normal,
            throttle_until: None,
        }
    }

    /// Fraction of window observations that were blocks.
    pub fn block_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let blocks = self.window.iter().filter(|s| s.status.is_block()).count();
        blocks as f64 / self.window.len() as f64
    }

    /// Fraction of window observations that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self
            .window
            .iter()
            .filter(|s| s.status == FetchStatus::Success)
            .count();
        ok as f64 / self.window.len() as f64
    }

    /// Mean observed latency over the window, in milliseconds.
    pub fn mean_latency_ms(&self) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let sum: u64 = self.window.iter().map(|s| s.latency_ms).sum();
        sum / self.window.len() as u64
    }

    fn hard_blocks(&self) -> usize {
        self.window
            .iter()
            .filter(|s| s.status == FetchStatus::HardBlock)
            .count()
    }
}

/// What the scheduler should do with a job against a given target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advice {
    /// Dispatch the job. `delay_factor` scales the session's inter-request
    /// delay; `halve_concurrency` caps the job's effective concurrency.
    Proceed {
        delay_factor: f64,
        halve_concurrency: bool,
    },
    /// Suppress dispatch until the throttle expires.
    Skip { until: DateTime<Utc> },
}

/// Aggregates outcome signals per target and emits throttle advice.
pub struct HealthMonitor {
    config: HealthConfig,
    targets: HashMap<String, TargetHealth>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            targets: HashMap::new(),
        }
    }

    /// Record a fetch outcome for a target and apply any escalation.
    ///
    /// Returns the level after the update so callers can observe
    /// transitions.
    pub fn record(
        &mut self,
        target: &str,
        status: FetchStatus,
        latency_ms: u64,
        now: DateTime<Utc>,
    ) -> ThrottleLevel {
        let window_size = self.config.window_size;
        let health = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| TargetHealth::new(target));

        health.window.push_back(OutcomeSample {
            at: now,
            status,
            latency_ms,
        });
        while health.window.len() > window_size {
            health.window.pop_front();
        }

        // A block observed while throttled pushes the expiry out.
        if status.is_block() && health.level != ThrottleLevel::Normal {
            let minutes = match health.level {
                ThrottleLevel::Soft => self.config.soft_cooldown_minutes,
                ThrottleLevel::Hard => self.config.hard_cooldown_minutes,
                ThrottleLevel::Normal => 0,
            };
            health.throttle_until = Some(now + Duration::minutes(minutes));
        }

        let rate = health.block_rate();
        let hard_blocks = health.hard_blocks();

        match health.level {
            ThrottleLevel::Normal => {
                if rate > self.config.hard_block_ratio
                    || hard_blocks >= self.config.hard_block_count
                {
                    // Escalate through Soft: the machine enters Hard from Soft,
                    // but a burst may cross both thresholds in one observation.
                    Self::escalate(health, ThrottleLevel::Soft, &self.config, now);
                    Self::escalate(health, ThrottleLevel::Hard, &self.config, now);
                } else if rate > self.config.soft_block_ratio {
                    Self::escalate(health, ThrottleLevel::Soft, &self.config, now);
                }
            }
            ThrottleLevel::Soft => {
                if rate > self.config.hard_block_ratio
                    || hard_blocks >= self.config.hard_block_count
                {
                    Self::escalate(health, ThrottleLevel::Hard, &self.config, now);
                }
            }
            ThrottleLevel::Hard => {}
        }

        health.level
    }

    /// Advice for dispatching a job of the given priority against a target.
    ///
    /// Applies passive cool-down expiry before answering, stepping the level
    /// down at most one step per expiry.
    pub fn advise(&mut self, target: &str, priority: Priority, now: DateTime<Utc>) -> Advice {
        self.decay(target, now);

        let Some(health) = self.targets.get(target) else {
            return Advice::Proceed {
                delay_factor: 1.0,
                halve_concurrency: false,
            };
        };

        match health.level {
            ThrottleLevel::Normal => Advice::Proceed {
                delay_factor: 1.0,
                halve_concurrency: false,
            },
            ThrottleLevel::Soft => Advice::Proceed {
                delay_factor: self.config.soft_delay_factor,
                halve_concurrency: true,
            },
            ThrottleLevel::Hard => {
                if priority == Priority::Urgent {
                    Advice::Proceed {
                        delay_factor: self.config.hard_delay_factor,
                        halve_concurrency: true,
                    }
                } else {
                    Advice::Skip {
                        until: health
                            .throttle_until
                            .unwrap_or_else(|| now + Duration::minutes(1)),
                    }
                }
            }
        }
    }

    /// Current level of a target, applying passive expiry first.
    pub fn level(&mut self, target: &str, now: DateTime<Utc>) -> ThrottleLevel {
        self.decay(target, now);
        self.targets
            .get(target)
            .map(|h| h.level)
            .unwrap_or(ThrottleLevel::Normal)
    }

    /// Snapshot of every tracked target's health.
    pub fn snapshot(&self) -> Vec<&TargetHealth> {
        self.targets.values().collect()
    }

    fn escalate(
        health: &mut TargetHealth,
        to: ThrottleLevel,
        config: &HealthConfig,
        now: DateTime<Utc>,
    ) {
        if to <= health.level {
            return;
        }
        let minutes = match to {
            ThrottleLevel::Soft => config.soft_cooldown_minutes,
            ThrottleLevel::Hard => config.hard_cooldown_minutes,
            ThrottleLevel::Normal => 0,
        };
        tracing::warn!(
            target = %health.target,
            from = %health.level,
            to = %to,
            block_rate = health.block_rate(),
            "throttle escalated"
        );
        health.level = to;
        health.throttle_until = Some(now + Duration::minutes(minutes));
    }

    /// Step the level down one notch per expired cool-down, never jumping
    /// Hard → Normal directly.
    fn decay(&mut self, target: &str, now: DateTime<Utc>) {
        let config = &self.config;
        if let Some(health) = self.targets.get_mut(target) {
            while let Some(until) = health.throttle_until {
                if now < until || health.level == ThrottleLevel::Normal {
                    break;
                }
                match health.level {
                    ThrottleLevel::Hard => {
                        health.level = ThrottleLevel::Soft;
                        health.throttle_until =
                            Some(until + Duration::minutes(config.soft_cooldown_minutes));
                        tracing::info!(target, "throttle relaxed to soft");
                    }
                    ThrottleLevel::Soft => {
                        health.level = ThrottleLevel::Normal;
                        health.throttle_until = None;
                        tracing::info!(target, "throttle cleared");
                    }
                    ThrottleLevel::Normal => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default())
    }

    fn feed(m: &mut HealthMonitor, target: &str, status: FetchStatus, n: usize, now: DateTime<Utc>) {
        for _ in 0..n {
            m.record(target, status, 100, now);
        }
    }

    #[test]
    fn test_stays_normal_under_success() {
        let mut m = monitor();
        let now = Utc::now();
        feed(&mut m, "shop.example", FetchStatus::Success, 20, now);
        assert_eq!(m.level("shop.example", now), ThrottleLevel::Normal);
    }

    #[test]
    fn test_soft_threshold_crossing() {
        let mut m = monitor();
        let now = Utc::now();
        // 15 successes, then soft blocks push the rate past 20%.
        feed(&mut m, "shop.example", FetchStatus::Success, 15, now);
        feed(&mut m, "shop.example", FetchStatus::SoftBlock, 5, now);
        assert_eq!(m.level("shop.example", now), ThrottleLevel::Soft);
    }

    #[test]
    fn test_two_hard_blocks_force_hard() {
        let mut m = monitor();
        let now = Utc::now();
        feed(&mut m, "shop.example", FetchStatus::Success, 10, now);
        m.record("shop.example", FetchStatus::HardBlock, 100, now);
        assert_ne!(m.level("shop.example", now), ThrottleLevel::Hard);
        m.record("shop.example", FetchStatus::HardBlock, 100, now);
        assert_eq!(m.level("shop.example", now), ThrottleLevel::Hard);
    }

    #[test]
    fn test_hard_never_steps_directly_to_normal() {
        let mut m = monitor();
        let t0 = Utc::now();
        feed(&mut m, "shop.example", FetchStatus::HardBlock, 5, t0);
        assert_eq!(m.level("shop.example", t0), ThrottleLevel::Hard);

        // Just past the hard cool-down: one step down only.
        let t1 = t0 + Duration::minutes(61);
        assert_eq!(m.level("shop.example", t1), ThrottleLevel::Soft);

        // After the subsequent soft cool-down it clears.
        let t2 = t1 + Duration::minutes(16);
        assert_eq!(m.level("shop.example", t2), ThrottleLevel::Normal);
    }

    #[test]
    fn test_hard_throttle_expiry_is_sixty_minutes() {
        let mut m = monitor();
        let t0 = Utc::now();
        feed(&mut m, "shop.example", FetchStatus::HardBlock, 5, t0);

        let health = m
            .snapshot()
            .into_iter()
            .find(|h| h.target == "shop.example")
            .unwrap();
        let until = health.throttle_until.unwrap();
        assert_eq!((until - t0).num_minutes(), 60);
    }

    #[test]
    fn test_hard_throttle_skips_normal_but_not_urgent() {
        let mut m = monitor();
        let now = Utc::now();
        feed(&mut m, "shop.example", FetchStatus::HardBlock, 5, now);

        match m.advise("shop.example", Priority::Normal, now) {
            Advice::Skip { until } => assert!(until > now),
            other => panic!("expected skip, got {other:?}"),
        }
        match m.advise("shop.example", Priority::Urgent, now) {
            Advice::Proceed { delay_factor, .. } => assert!(delay_factor > 1.0),
            other => panic!("expected proceed, got {other:?}"),
        }
    }

    #[test]
    fn test_soft_throttle_halves_concurrency_and_doubles_delay() {
        let mut m = monitor();
        let now = Utc::now();
        feed(&mut m, "shop.example", FetchStatus::Success, 15, now);
        feed(&mut m, "shop.example", FetchStatus::SoftBlock, 5, now);

        match m.advise("shop.example", Priority::Normal, now) {
            Advice::Proceed {
                delay_factor,
                halve_concurrency,
            } => {
                assert_eq!(delay_factor, 2.0);
                assert!(halve_concurrency);
            }
            other => panic!("expected proceed, got {other:?}"),
        }
    }

    #[test]
    fn test_block_during_throttle_extends_expiry() {
        let mut m = monitor();
        let t0 = Utc::now();
        feed(&mut m, "shop.example", FetchStatus::Success, 15, t0);
        feed(&mut m, "shop.example", FetchStatus::SoftBlock, 5, t0);
        assert_eq!(m.level("shop.example", t0), ThrottleLevel::Soft);

        // Another block 10 minutes in pushes expiry past the original.
        let t1 = t0 + Duration::minutes(10);
        m.record("shop.example", FetchStatus::SoftBlock, 100, t1);
        let t2 = t0 + Duration::minutes(16);
        assert_eq!(m.level("shop.example", t2), ThrottleLevel::Soft);
    }

    #[test]
    fn test_unknown_target_proceeds_unthrottled() {
        let mut m = monitor();
        let now = Utc::now();
        assert_eq!(
            m.advise("never-seen.example", Priority::Low, now),
            Advice::Proceed {
                delay_factor: 1.0,
                halve_concurrency: false
            }
        );
    }
}

//! Shared data model: priorities, fetch outcomes, run records, snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dispatch priority of a job. Higher priorities win under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Classification of a single fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// Page retrieved and content looks usable.
    Success,
    /// Response received but content indicates a challenge (captcha,
    /// verification page). Recoverable by switching identity and retrying.
    SoftBlock,
    /// Explicit denial. The identity is burned and the target's throttle
    /// escalates.
    HardBlock,
    /// Transport-level failure (DNS, connect, 5xx).
    NetworkError,
    /// The configured per-attempt deadline elapsed. Treated like
    /// NetworkError for retry purposes but logged distinctly.
    Timeout,
}

impl FetchStatus {
    /// Whether this outcome counts as block pressure against the target.
    pub fn is_block(self) -> bool {
        matches!(self, FetchStatus::SoftBlock | FetchStatus::HardBlock)
    }

    /// Whether a retry with a fresh identity may succeed within the same run.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FetchStatus::SoftBlock | FetchStatus::NetworkError | FetchStatus::Timeout
        )
    }
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::SoftBlock => write!(f, "soft_block"),
            Self::HardBlock => write!(f, "hard_block"),
            Self::NetworkError => write!(f, "network_error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of one fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: FetchStatus,
    /// Raw page content, present only on Success or SoftBlock.
    pub raw_content: Option<String>,
    pub latency_ms: u64,
    /// The response was a rate-limit push-back (HTTP 429). The caller
    /// carries this across retries so a repeat escalates.
    pub rate_limited: bool,
}

impl FetchResult {
    pub fn failure(status: FetchStatus, latency_ms: u64) -> Self {
        Self {
            status,
            raw_content: None,
            latency_ms,
            rate_limited: false,
        }
    }
}

/// Final outcome of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Fetch worked but extraction failed for at least one item.
    PartialSuccess,
    Failed,
    /// Dispatch suppressed by throttle or shutdown; no fetch was attempted.
    Skipped,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialSuccess => write!(f, "partial_success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Immutable record of one execution attempt of a job.
///
/// Every dispatch produces exactly one finalized record; silent failures are
/// disallowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: String,
    /// Monotonic per-job run sequence number.
    pub run_id: u64,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    /// Definitive reason string when the run did not fully succeed.
    pub failure_reason: Option<String>,
    pub items_processed: usize,
}

impl JobRun {
    /// Idempotency key for persistence writes. Includes the start instant
    /// because run sequences restart from zero with a fresh registry.
    pub fn key(&self) -> String {
        format!(
            "{}#{}@{}",
            self.job_id,
            self.run_id,
            self.started_at.timestamp()
        )
    }
}

/// Structured record produced by the extraction collaborator from a fetched
/// product page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub product_id: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub available: bool,
    pub seller: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl ProductSnapshot {
    /// Idempotency key for persistence writes.
    pub fn key(&self) -> String {
        format!("{}@{}", self.product_id, self.captured_at.timestamp())
    }
}

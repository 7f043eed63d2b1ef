//! Job registry — definitions, due-job ordering, and run bookkeeping.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cadence::Cadence;
use crate::error::{CoreError, CoreResult};
use crate::types::{JobRun, Priority, RunOutcome};

/// Retry behaviour for transient failures within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    /// Cap applied to the exponential backoff.
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 1,
            max_delay_secs: 300,
        }
    }
}

/// The closed set of work a job can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch and extract the given product pages.
    Scrape { urls: Vec<String> },
    /// Hand stored history to the export collaborator.
    Export,
    /// Prune run history and sweep retired identities.
    Cleanup,
    /// Invoke a callback registered with the scheduler by id.
    Custom { callback: String },
}

/// A registered job. Mutated only through registry operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    /// Site this job runs against; throttle and identity state key.
    pub target: String,
    pub kind: JobKind,
    pub cadence: Cadence,
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> u32 {
    1
}

/// Point-in-time view of one job for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub target: String,
    pub priority: Priority,
    pub enabled: bool,
    pub paused: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub in_flight: u32,
}

struct JobState {
    def: JobDefinition,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    run_seq: u64,
    run_count: u64,
    success_count: u64,
    failure_count: u64,
    in_flight: u32,
    history: VecDeque<JobRun>,
}

/// Holds job definitions and run history.
pub struct JobRegistry {
    jobs: HashMap<String, JobState>,
    history_keep: usize,
}

impl JobRegistry {
    pub fn new(history_keep: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            history_keep,
        }
    }

    /// Register a job, or replace the definition of an existing id.
    ///
    /// Replacement preserves run history and the run-id sequence; the next
    /// scheduled time is recomputed from the new cadence.
    pub fn register(&mut self, def: JobDefinition, now: DateTime<Utc>) -> CoreResult<()> {
        if def.id.trim().is_empty() {
            return Err(CoreError::InvalidJob("empty job id".to_string()));
        }
        if def.target.trim().is_empty() {
            return Err(CoreError::InvalidJob(format!(
                "job '{}' has no target",
                def.id
            )));
        }
        if def.max_concurrency == 0 {
            return Err(CoreError::InvalidJob(format!(
                "job '{}' has zero max_concurrency",
                def.id
            )));
        }
        if let JobKind::Scrape { urls } = &def.kind {
            if urls.is_empty() {
                return Err(CoreError::InvalidJob(format!(
                    "scrape job '{}' has no urls",
                    def.id
                )));
            }
        }

        let next = match def.cadence {
            // One-shots and intervals are due immediately on registration.
            Cadence::Once | Cadence::Interval { .. } => Some(now),
            _ => def.cadence.next_after(now),
        };

        match self.jobs.get_mut(&def.id) {
            Some(state) => {
                tracing::info!(job = %def.id, "job definition replaced");
                state.def = def;
                state.next_run = next;
            }
            None => {
                tracing::info!(job = %def.id, cadence = %def.cadence, "job registered");
                self.jobs.insert(
                    def.id.clone(),
                    JobState {
                        def,
                        next_run: next,
                        last_run: None,
                        run_seq: 0,
                        run_count: 0,
                        success_count: 0,
                        failure_count: 0,
                        in_flight: 0,
                        history: VecDeque::new(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Soft-deactivate a job. The definition stays resident while run
    /// history references it; it simply never becomes due again.
    pub fn deactivate(&mut self, id: &str) -> CoreResult<()> {
        let state = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownJob(id.to_string()))?;
        state.def.enabled = false;
        state.next_run = None;
        tracing::info!(job = id, "job deactivated");
        Ok(())
    }

    pub fn pause(&mut self, id: &str) -> CoreResult<()> {
        let state = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownJob(id.to_string()))?;
        state.def.paused = true;
        Ok(())
    }

    pub fn resume(&mut self, id: &str) -> CoreResult<()> {
        let state = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownJob(id.to_string()))?;
        state.def.paused = false;
        Ok(())
    }

    /// Jobs due at `now`, ordered by priority descending, ties broken
    /// oldest-due-first. Jobs already at their per-job concurrency limit are
    /// excluded.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<JobDefinition> {
        let mut due: Vec<(&JobState, DateTime<Utc>)> = self
            .jobs
            .values()
            .filter_map(|s| {
                let next = s.next_run?;
                let eligible = s.def.enabled
                    && !s.def.paused
                    && next <= now
                    && s.in_flight < s.def.max_concurrency;
                eligible.then_some((s, next))
            })
            .collect();

        due.sort_by(|(a, a_due), (b, b_due)| {
            b.def
                .priority
                .cmp(&a.def.priority)
                .then(a_due.cmp(b_due))
                .then(a.def.id.cmp(&b.def.id))
        });

        due.into_iter().map(|(s, _)| s.def.clone()).collect()
    }

    /// Open a run for a job: allocates the next run id and counts it
    /// in-flight.
    pub fn begin_run(&mut self, id: &str, now: DateTime<Utc>) -> CoreResult<JobRun> {
        let state = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownJob(id.to_string()))?;
        state.run_seq += 1;
        state.in_flight += 1;
        let scheduled_at = state.next_run.unwrap_or(now);
        Ok(JobRun {
            job_id: id.to_string(),
            run_id: state.run_seq,
            scheduled_at,
            started_at: now,
            finished_at: None,
            outcome: RunOutcome::Skipped,
            failure_reason: None,
            items_processed: 0,
        })
    }

    /// Finalize a run: append to bounded history, update counters, and
    /// advance the next scheduled time from the completion instant.
    pub fn record_run(&mut self, run: JobRun, now: DateTime<Utc>) -> CoreResult<()> {
        let state = self
            .jobs
            .get_mut(&run.job_id)
            .ok_or_else(|| CoreError::UnknownJob(run.job_id.clone()))?;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_run = Some(run.started_at);
        state.run_count += 1;
        match run.outcome {
            RunOutcome::Success | RunOutcome::PartialSuccess => state.success_count += 1,
            RunOutcome::Failed => state.failure_count += 1,
            RunOutcome::Skipped => {}
        }

        // Skipped runs never advance the cadence; the deferral (if any) is
        // applied separately so a throttled job re-enters evaluation when
        // the throttle lifts, not a full cadence later.
        if run.outcome != RunOutcome::Skipped {
            state.next_run = state.def.cadence.next_after(now);
        }

        state.history.push_back(run);
        while state.history.len() > self.history_keep {
            state.history.pop_front();
        }
        Ok(())
    }

    /// Push a job's next evaluation to `until` (throttle skip deferral).
    pub fn defer(&mut self, id: &str, until: DateTime<Utc>) -> CoreResult<()> {
        let state = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownJob(id.to_string()))?;
        if state.next_run.is_some() {
            state.next_run = Some(until);
        }
        Ok(())
    }

    /// Make a job due immediately.
    pub fn make_due(&mut self, id: &str, now: DateTime<Utc>) -> CoreResult<()> {
        let state = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownJob(id.to_string()))?;
        state.next_run = Some(now);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&JobDefinition> {
        self.jobs.get(id).map(|s| &s.def)
    }

    pub fn history(&self, id: &str) -> Vec<JobRun> {
        self.jobs
            .get(id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.jobs.get(id).map(|s| JobStatus {
            id: s.def.id.clone(),
            name: s.def.name.clone(),
            target: s.def.target.clone(),
            priority: s.def.priority,
            enabled: s.def.enabled,
            paused: s.def.paused,
            next_run: s.next_run,
            last_run: s.last_run,
            run_count: s.run_count,
            success_count: s.success_count,
            failure_count: s.failure_count,
            success_rate: if s.run_count > 0 {
                s.success_count as f64 / s.run_count as f64
            } else {
                0.0
            },
            in_flight: s.in_flight,
        })
    }

    pub fn summary(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self
            .jobs
            .keys()
            .filter_map(|id| self.job_status(id))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Total in-flight runs across all jobs.
    pub fn total_in_flight(&self) -> u32 {
        self.jobs.values().map(|s| s.in_flight).sum()
    }

    /// Drop history entries older than `cutoff` (cleanup job).
    pub fn prune_history(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        for state in self.jobs.values_mut() {
            let before = state.history.len();
            state.history.retain(|r| r.started_at >= cutoff);
            dropped += before - state.history.len();
        }
        dropped
    }
}

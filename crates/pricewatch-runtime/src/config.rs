//! Runtime configuration loading and resolution.
//!
//! Resolution order for the config path: explicit flag, then the
//! `PRICEWATCH_CONFIG` env var, then `pricewatch.json` in the working
//! directory. A missing file yields the built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pricewatch::{HealthConfig, IdentityPoolConfig, JobDefinition};

use crate::error::{RuntimeError, RuntimeResult};

/// Inter-request delay knobs for fetch sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-attempt deadline in milliseconds.
    pub timeout_ms: u64,
    /// Randomized pre-fetch delay bounds in milliseconds.
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Disable the randomized delay entirely (deterministic tests).
    #[serde(default)]
    pub disable_delay: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            delay_min_ms: 1_000,
            delay_max_ms: 3_000,
            disable_delay: false,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Scheduler tick interval in seconds.
    pub tick_secs: u64,
    /// Global concurrency ceiling across all jobs.
    pub global_concurrency: usize,
    /// Grace period for in-flight runs at shutdown, in seconds.
    pub shutdown_grace_secs: u64,
    /// Run-history entries kept per job.
    pub history_keep: usize,
    /// Age cutoff applied by cleanup jobs when pruning run history.
    #[serde(default = "default_retention_days")]
    pub history_retention_days: i64,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pool: IdentityPoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Jobs seeded into the registry at startup.
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            global_concurrency: 4,
            shutdown_grace_secs: 30,
            history_keep: 100,
            history_retention_days: default_retention_days(),
            fetch: FetchConfig::default(),
            pool: IdentityPoolConfig::default(),
            health: HealthConfig::default(),
            jobs: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Sanity checks applied before the scheduler starts.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.tick_secs == 0 {
            return Err(RuntimeError::Config("tick_secs must be > 0".to_string()));
        }
        if self.global_concurrency == 0 {
            return Err(RuntimeError::Config(
                "global_concurrency must be > 0".to_string(),
            ));
        }
        if self.fetch.delay_min_ms > self.fetch.delay_max_ms {
            return Err(RuntimeError::Config(
                "fetch.delay_min_ms exceeds fetch.delay_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_retention_days() -> i64 {
    30
}

/// Resolve the config file path.
pub fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }
    if let Ok(env_path) = std::env::var("PRICEWATCH_CONFIG") {
        return PathBuf::from(env_path);
    }
    PathBuf::from("pricewatch.json")
}

/// Load configuration from the resolved path, falling back to defaults
/// when the file does not exist.
pub fn load(explicit: Option<&str>) -> RuntimeResult<RuntimeConfig> {
    let path = resolve_config_path(explicit);
    if !path.exists() {
        tracing::info!("no config file at {}, using defaults", path.display());
        return Ok(RuntimeConfig::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let config: RuntimeConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}

//! Pricewatch core — deterministic state machines for resilient scrape
//! scheduling.
//!
//! Everything here is clock-injected and I/O-free: the identity pool, the
//! per-target throttle machine, the job registry, cadence math, and the
//! retry driver. The tokio runtime lives in `pricewatch-runtime`.

pub mod cadence;
pub mod error;
pub mod health;
pub mod identity;
pub mod registry;
pub mod retry;
pub mod types;

pub use cadence::Cadence;
pub use error::{CoreError, CoreResult};
pub use health::{Advice, HealthConfig, HealthMonitor, TargetHealth, ThrottleLevel};
pub use identity::{BrowserProfile, Identity, IdentityPool, IdentityPoolConfig, IdentityStatus};
pub use registry::{JobDefinition, JobKind, JobRegistry, JobStatus, RetryPolicy};
pub use retry::{backoff_delay, RetryDriver, RunState, Step};
pub use types::{FetchResult, FetchStatus, JobRun, Priority, ProductSnapshot, RunOutcome};

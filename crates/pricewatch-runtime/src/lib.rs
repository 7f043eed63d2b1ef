//! Pricewatch runtime — the tokio orchestrator around the core state
//! machines: scheduler tick loop, fetch sessions, event bus, and the
//! extraction/persistence collaborator seams.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod scheduler;
pub mod session;

pub use collaborators::{ExtractError, Extractor, JsonExtractor, JsonlStore, MemoryStore, RunStore};
pub use config::{load as load_config, resolve_config_path, RuntimeConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use events::{EventReceiver, EventSender, TrackerEvent};
pub use fetch::{DelayPolicy, HttpFetcher, PageFetcher};
pub use scheduler::{JobCallback, Scheduler, SchedulerMetrics, SchedulerStatus, SystemHealth};
pub use session::SessionGuard;

//! Core error type shared by the pool, registry, and health modules.

/// All errors the core state machines can produce.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// The identity pool is at capacity and every identity is cooling or
    /// retired.
    #[error("identity pool exhausted for target: {0}")]
    IdentityExhausted(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// Rejected at registration time; invalid definitions never reach the
    /// scheduler loop.
    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("unknown callback: {0}")]
    UnknownCallback(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

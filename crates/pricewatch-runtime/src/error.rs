//! Runtime error type.

use pricewatch::CoreError;

/// All errors the runtime can surface.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Store(String),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("job {0} already has its maximum runs in flight")]
    AtCapacity(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

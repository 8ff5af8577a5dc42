use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// Missing or malformed job configuration. Raised before any resource is touched.
    #[error("config error: {0}")]
    Config(String),

    /// A required identifier could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    /// Fatal problem with user-supplied bulk dataset input.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Cooperative cancellation. Not a failure; the runner maps it to its own exit code.
    #[error("cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error("metadata store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TrainingError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

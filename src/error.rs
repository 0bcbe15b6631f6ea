use thiserror::Error;

/// Result alias used by every pipeline stage
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors that abort a pipeline run. None of them are retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required setting could not be resolved, or a value is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Elasticsearch could not be reached or rejected the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote dataset could not be retrieved
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Input (dataset, snapshot, JSON documents) was malformed
    #[error("Parse error: {0}")]
    Parse(String),

    /// The live index shrank compared to the last recorded count
    #[error(
        "Stability violation on index '{index}': document count dropped from {previous} to {current}"
    )]
    StabilityViolation {
        index: String,
        previous: u64,
        current: u64,
    },

    /// Index creation, bulk insert, reindex or alias update failed
    #[error("Indexing error: {0}")]
    Indexing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn indexing(msg: impl Into<String>) -> Self {
        Self::Indexing(msg.into())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Parse(err.to_string())
    }
}

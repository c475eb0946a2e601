use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur in the publish-and-acknowledge pipeline
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Caller error, rejected before any send is dispatched
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A sequence index was registered twice in the same batch
    #[error("Duplicate tracker entry for sequence index {sequence_index}")]
    DuplicateEntry { sequence_index: u32 },

    /// A resolution arrived for a sequence index with no pending entry
    #[error("Unknown tracker entry for sequence index {sequence_index}")]
    UnknownEntry { sequence_index: u32 },

    /// Broker-reported error that is safe to retry
    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    /// Broker-reported error that will not succeed on retry
    #[error("Permanent broker error: {0}")]
    PermanentBroker(String),

    /// Deadline-driven expiry, not a broker error
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Publisher lifecycle errors
    #[error("Publisher error: {0}")]
    Publisher(String),

    /// Consumer worker lifecycle errors
    #[error("Worker error: {0}")]
    Worker(String),

    /// Unrecoverable broker session failure, stops the worker
    #[error("Broker session error: {0}")]
    BrokerSession(String),

    /// Offset commit failure
    #[error("Commit error: {0}")]
    Commit(String),

    /// Dead-letter sink failure
    #[error("Dead-letter sink error: {0}")]
    DeadLetter(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PipelineError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        PipelineError::Timeout { timeout_ms: 0 }
    }
}

impl PipelineError {
    /// Get the error category for metrics and log labelling
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::InvalidConfig(_) => "configuration",
            PipelineError::DuplicateEntry { .. } | PipelineError::UnknownEntry { .. } => {
                "tracker_invariant"
            }
            PipelineError::TransientBroker(_) => "broker_transient",
            PipelineError::PermanentBroker(_) => "broker_permanent",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Publisher(_) => "publisher",
            PipelineError::Worker(_) => "worker",
            PipelineError::BrokerSession(_) => "broker_session",
            PipelineError::Commit(_) => "commit",
            PipelineError::DeadLetter(_) => "dead_letter",
            PipelineError::Serialization(_) => "serialization",
            PipelineError::Cancelled => "cancelled",
        }
    }

    /// Check if the error is retryable under the publish retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientBroker(_) | PipelineError::Timeout { .. }
        )
    }

    /// Check if the error indicates an internal invariant violation.
    ///
    /// These signal an integration bug between the pipeline and the broker
    /// callback path and are always logged, never silently swallowed.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            PipelineError::DuplicateEntry { .. } | PipelineError::UnknownEntry { .. }
        )
    }
}

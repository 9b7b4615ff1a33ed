use thiserror::Error;

/// Unified error type for the lazybatch library.
///
/// Every variant is `Clone` because settled failures are cached in the
/// per-request error store and re-surfaced to every caller that asks for
/// the same task id.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    /// A task producer returned an error.
    #[error("producer for task '{task_id}' failed: {message}")]
    ProducerFailed { task_id: String, message: String },

    /// A task producer panicked while running.
    #[error("producer for task '{task_id}' panicked: {message}")]
    ProducerPanicked { task_id: String, message: String },

    /// A deduplicated call settled with a failure; the failure is cached
    /// and replayed for every later call with the same key.
    #[error("deduped call '{key}' failed: {message}")]
    DedupeFailed { key: String, message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl BatchError {
    /// Create a producer failure from an `anyhow` error, preserving the
    /// cause chain in the rendered message.
    pub fn producer_failed<S: Into<String>>(task_id: S, source: &anyhow::Error) -> Self {
        Self::ProducerFailed {
            task_id: task_id.into(),
            message: format!("{:#}", source),
        }
    }

    /// Create a producer panic error from a recovered panic message.
    pub fn producer_panicked<S: Into<String>, M: Into<String>>(task_id: S, message: M) -> Self {
        Self::ProducerPanicked {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create a dedupe failure from an `anyhow` error.
    pub fn dedupe_failed<S: Into<String>>(key: S, source: &anyhow::Error) -> Self {
        Self::DedupeFailed {
            key: key.into(),
            message: format!("{:#}", source),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The task id this error is scoped to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::ProducerFailed { task_id, .. } | Self::ProducerPanicked { task_id, .. } => {
                Some(task_id)
            }
            _ => None,
        }
    }

    /// The underlying failure message, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::ProducerFailed { message, .. }
            | Self::ProducerPanicked { message, .. }
            | Self::DedupeFailed { message, .. }
            | Self::Configuration { message } => message,
        }
    }
}

/// Result type alias using the unified error
pub type Result<T> = std::result::Result<T, BatchError>;

//! Error kinds of the GraphRAG core.
//!
//! Per-item failures (one chunk, one Map candidate) are not errors: they are
//! logged, counted into `warnings`, and the pipeline continues. The variants
//! here are the failures that abort a call or a build step.

use thiserror::Error;

/// Library-level error type.
#[derive(Debug, Error)]
pub enum GraphRagError {
    /// Missing series, missing provider, malformed options. Fatal to the call.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Graph store unreachable after retries. Fatal to the current step.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Chat/embedding provider failed after retries.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider returned non-JSON where JSON was expected and the lenient
    /// parser could not recover anything usable.
    #[error("unparseable provider output: {0}")]
    ParseError(String),

    /// The series has no chunks or no graph.
    #[error("not found: {0}")]
    NotFound(String),

    /// A prompt would exceed the model context even after truncation.
    #[error("token budget exceeded: {0}")]
    BudgetExceeded(String),

    /// A build step failed; the step name travels with the error so partial
    /// reports can say where the pipeline stopped.
    #[error("build step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<GraphRagError>,
    },
}

impl GraphRagError {
    /// Wrap an error with the name of the build step it occurred in.
    #[must_use]
    pub fn in_step(self, step: &'static str) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// Name of the failing step, if this is a step error.
    #[must_use]
    pub fn step_name(&self) -> Option<&'static str> {
        match self {
            Self::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T, E = GraphRagError> = std::result::Result<T, E>;

impl From<sqlx::Error> for GraphRagError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for GraphRagError {
    fn from(err: reqwest::Error) -> Self {
        Self::ProviderUnavailable(err.to_string())
    }
}

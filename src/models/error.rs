//! Error types for histmatch.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad config, bad request, malformed input)
//! - I^B materialized: Infrastructure failures (IO, rank transport, model)
//! - K_i violated: Internal invariant violations (bugs)

use thiserror::Error;

/// Top-level error type for histmatch.
#[derive(Debug, Error)]
pub enum HistMatchError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    /// Bad static configuration (bounds, cut list, method, sample counts).
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    /// Structurally valid request that the current emulator state cannot satisfy.
    #[error("Request error: {0}")]
    Request(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Type mismatch: {0}")]
    Type(String),

    #[error("Invalid value: {0}")]
    Value(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Model evaluation failed: {0}")]
    Model(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Communicator error: {0}")]
    Comm(String),

    /// Observed by workers when the controller tears worker mode down after a failure.
    #[error("Worker mode aborted by controller: {0}")]
    WorkerModeAborted(String),

    /// A controller-side failure relayed to a worker through a shared broadcast.
    #[error("Controller reported failure: {0}")]
    Remote(String),

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HistMatchError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error leaves the pipeline untouched and can be fixed by the caller.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            Self::Request(_)
                | Self::Config(_)
                | Self::Input(_)
                | Self::Shape(_)
                | Self::Type(_)
                | Self::Value(_)
                | Self::NotSupported(_)
        )
    }
}

impl From<serde_json::Error> for HistMatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::ParseError(e.to_string())
    }
}

/// A satisfiable but suboptimal request.
///
/// Logged with `tracing::warn!` and kept on the pipeline so callers can inspect it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RequestWarning {
    /// Iteration the warning was raised for, if any
    pub emul_i: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for RequestWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.emul_i {
            Some(i) => write!(f, "iteration {i}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Result type alias for histmatch.
pub type Result<T> = std::result::Result<T, HistMatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_level_classification() {
        assert!(HistMatchError::Request("x".into()).is_request_level());
        assert!(HistMatchError::Shape("x".into()).is_request_level());
        assert!(!HistMatchError::Internal("x".into()).is_request_level());
        assert!(!HistMatchError::Comm("x".into()).is_request_level());
    }

    #[test]
    fn test_warning_display() {
        let w = RequestWarning {
            emul_i: Some(2),
            message: "few samples".to_string(),
        };
        assert_eq!(w.to_string(), "iteration 2: few samples");
    }
}

//! Error types for measure evaluation.
//!
//! Only genuinely fatal conditions are errors. Layers that cannot be
//! spatially realigned, degenerate quotient denominators and zero-variance
//! thresholds are resolved in place and never surface here.

use thiserror::Error;

/// Result type for measure operations.
pub type Result<T> = std::result::Result<T, MeasureError>;

/// Errors that can occur while streaming activations or aggregating measures.
#[derive(Debug, Error)]
pub enum MeasureError {
    /// Invalid configuration, raised before any computation starts.
    #[error("invalid configuration for {field}: {reason}")]
    Config { field: String, reason: String },

    /// Two arrays that must agree in shape do not.
    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Activation shapes can only be observed on a non-empty dataset.
    #[error("dataset is empty, activation shapes cannot be observed")]
    EmptyDataset,

    /// The model or dataset collaborator failed.
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] anyhow::Error),

    /// A layer worker returned an error; the whole evaluation is aborted.
    #[error("worker for layer {layer} failed: {source}")]
    WorkerFailed {
        layer: String,
        #[source]
        source: Box<MeasureError>,
    },

    /// A layer worker panicked.
    #[error("worker for layer {0} panicked")]
    WorkerPanicked(String),

    /// A channel closed in the middle of a group.
    #[error("activation stream interrupted: {0}")]
    StreamInterrupted(String),
}

// Convenience constructors
impl MeasureError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        MeasureError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], found: &[usize]) -> Self {
        MeasureError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// True when the error only reports that the consuming side went away.
    pub(crate) fn is_disconnect(&self) -> bool {
        matches!(self, MeasureError::StreamInterrupted(_))
    }
}

use std::path::PathBuf;
use thiserror::Error;

/// Fatal error taxonomy for a training run.
///
/// None of these are retried in-process: the recovery mechanism for a
/// long-running run is a restart from the last checkpoint.
#[derive(Debug, Error)]
pub enum TrainError {
    /// A stored configuration is structurally incompatible with the one the
    /// run was launched with. Raised before any weights are applied.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// A checkpoint or retrieval artifact could not be deserialized.
    #[error("corrupt artifact at {path}: {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },

    /// A loss came back NaN or infinite. Surfaced before the corresponding
    /// optimizer step so the last-good state stays recoverable.
    #[error("numerical instability: {loss} = {value} at step {step}")]
    NumericalInstability {
        loss: &'static str,
        step: usize,
        value: f64,
    },

    /// Batch tensors disagree with the configured resolution levels.
    #[error("tensor shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("i/o error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TrainError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptArtifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

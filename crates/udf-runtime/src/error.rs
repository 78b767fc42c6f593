use frame_core::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
/// Errors surfaced by UDF loading, configuration, and execution.
pub enum RuntimeError {
    #[error("invalid pipeline configuration: {0}")]
    ConfigInvalid(String),
    #[error("failed to load UDF {name:?}: {reason}")]
    UdfLoadFailed { name: String, reason: String },
    #[error("failed to initialize UDF {name:?}: {reason}")]
    UdfInitFailed { name: String, reason: String },
    #[error("UDF {name:?} failed while processing: {reason}")]
    Process { name: String, reason: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

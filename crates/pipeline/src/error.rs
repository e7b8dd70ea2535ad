//! Error types for the pipeline system

use thiserror::Error;

/// Configuration and lifecycle errors.
///
/// These are raised synchronously to whoever assembles or drives a pipeline.
/// Running stages never produce them; see [`StageError`] for that.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage not found: {name}")]
    StageNotFound { name: String },

    #[error("Circular dependency detected in pipeline graph")]
    CircularDependency,

    #[error("Invalid stage configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Stage type not registered: {stage_type}")]
    UnknownStageType { stage_type: String },

    #[error("Connection '{connection}' already has {max} consumers attached")]
    ConsumerCapacityExceeded { connection: String, max: usize },

    #[error("Connection '{connection}' already has a producer attached")]
    ProducerAlreadyAttached { connection: String },

    #[error("Connection '{connection}' does not carry the element type expected by stage '{stage_type}'")]
    ConnectionTypeMismatch { connection: String, stage_type: String },

    #[error("Stage '{stage}' is missing its {which} connection")]
    MissingConnection { stage: String, which: &'static str },

    #[error("Stage '{stage}' is already running")]
    AlreadyRunning { stage: String },

    #[error("Invalid pipeline state: {0}")]
    InvalidState(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        PipelineError::InvalidConfiguration {
            message: message.into(),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error returned by a stage callback.
///
/// The driving loop logs it, counts it and keeps going.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("bad param {0}")]
    BadParam(String),
    #[error("processing failed: {0}")]
    Processing(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Io(err.to_string())
    }
}

impl From<StageError> for PipelineError {
    fn from(err: StageError) -> Self {
        PipelineError::config(err.to_string())
    }
}

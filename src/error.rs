use thiserror::Error;

use crate::queue::QueueState;

/// Coarse classification of every error the engine can raise.
///
/// Callers that only need to decide "halt or continue" match on this
/// instead of the full [`Error`] enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PlanInvalid,
    StepAmbiguous,
    TestFailure,
    RegressionFailure,
    QueueIOFault,
    SetupFault,
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Plan validation failed:\n  {}", .0.join("\n  "))]
    PlanInvalid(Vec<String>),

    #[error("Step {step} needs clarification: {message}")]
    StepAmbiguous { step: String, message: String },

    #[error("Test for step {step} failed with exit code {exit_code}:\n{output}")]
    TestFailure {
        step: String,
        exit_code: i32,
        output: String,
    },

    #[error("Regression check failed after retry for batch {batch}:\n{output}")]
    RegressionFailure { batch: usize, output: String },

    #[error("Failed to move task ({from} -> {to}): {filename} - {message}")]
    QueueIo {
        filename: String,
        from: QueueState,
        to: QueueState,
        message: String,
    },

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generator binary not found: {0}")]
    GeneratorNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Merge conflict in {0}")]
    MergeConflict(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PlanInvalid(_) => ErrorKind::PlanInvalid,
            Error::StepAmbiguous { .. } => ErrorKind::StepAmbiguous,
            Error::TestFailure { .. } => ErrorKind::TestFailure,
            Error::RegressionFailure { .. } => ErrorKind::RegressionFailure,
            Error::QueueIo { .. } => ErrorKind::QueueIOFault,
            Error::Setup(_) | Error::NoHomeDir => ErrorKind::SetupFault,
            _ => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

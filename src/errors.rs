//! Typed error hierarchy for Edocebiv.
//!
//! One enum per subsystem:
//! - `WorkspaceError`: project file operations
//! - `ContainerError`: Docker container lifecycle and exec
//! - `LlmError`: chat-completion transport failures
//! - `ReasoningError`: reasoning step and chain failures

use thiserror::Error;

/// Message shared by every path-containment rejection.
pub const INVALID_PATH_MESSAGE: &str =
    "Invalid file path. The file must be within the project directory.";

/// Errors from project workspace file operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("{}", INVALID_PATH_MESSAGE)]
    InvalidPath { path: String },

    #[error("File {path} already exists.")]
    AlreadyExists { path: String },

    #[error("File {path} does not exist.")]
    NotFound { path: String },

    #[error("{path} is a directory, not a file.")]
    IsDirectory { path: String },

    #[error("{path} is a file, not a directory.")]
    NotADirectory { path: String },

    #[error("Patch does not apply to {path}: {reason}")]
    PatchMismatch { path: String, reason: String },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(path: &str, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Errors from the container subsystem.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Docker is not available")]
    Unavailable,

    #[error("Project has no container")]
    NoContainer,

    #[error("Container {id} not found")]
    NotFound { id: String },

    #[error("Container is not running. Current status: {status}.")]
    NotRunning { status: String },

    #[error("Failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("Command timed out after {seconds} seconds.")]
    Timeout { seconds: u64 },

    #[error("Docker API error: {0}")]
    Api(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the chat-completion client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OpenAI API error: {0}")]
    Api(String),

    #[error("Request to the model failed: {0}")]
    Transport(String),

    #[error("Model returned no choices")]
    EmptyResponse,
}

/// Errors from reasoning step execution.
#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Reasoning session {id} not found")]
    SessionNotFound { id: i64 },

    #[error("This reasoning session is already complete")]
    SessionComplete,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

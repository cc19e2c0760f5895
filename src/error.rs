//! Error types for the backend, the language runtime, the room registry and
//! config loading.
//!
//! Every error that can reach a client is mapped onto a wire [`ErrorCode`];
//! teardown failures never leave this crate as errors, they are only logged.

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Failure reported by an execution backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("I/O error during backend operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// The resource is already gone, which teardown paths treat as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::NotFound(_) => true,
            BackendError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }
}

/// Failure of a language runtime operation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Language not found: {0}")]
    LanguageNotFound(String),
    #[error("Code already running")]
    AlreadyRunning,
    #[error("Runtime is stopped")]
    Stopped,
    #[error("Language {0} has no {1} command")]
    Unsupported(String, &'static str),
    #[error("Cannot encode request payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RuntimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::AlreadyRunning => ErrorCode::ErrCodeAlreadyRunning,
            _ => ErrorCode::ErrServiceInternal,
        }
    }
}

/// Rejection of a new room session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Invalid room key: {0:?}")]
    InvalidRoomKey(String),
    #[error("Room session already exists: {0}")]
    RoomExists(String),
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::InvalidRoomKey(_) => ErrorCode::ErrInvalidRoomKey,
            RoomError::RoomExists(_) => ErrorCode::ErrInitRoomExists,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

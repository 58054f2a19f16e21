use crate::host::HostState;
use std::path::PathBuf;
use thiserror::Error;

/// Failures inside a runtime backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("failed to load '{}': {reason}", .path.display())]
    LibraryLoad { path: PathBuf, reason: String },
    #[error("entry point '{0}' not found")]
    MissingEntryPoint(String),
    #[error("managed runtime failed to start: {0}")]
    StartFailed(String),
    #[error("failed to load assembly '{}': {reason}", .path.display())]
    AssemblyLoad { path: PathBuf, reason: String },
    #[error("managed method '{0}' not found")]
    MissingMethod(String),
    #[error("failed to read fast-invoke manifest '{}': {reason}", .path.display())]
    Manifest { path: PathBuf, reason: String },
    #[error("backend not started")]
    NotStarted,
    #[error("dispatcher protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("host not initialized")]
    NotInitialized,
    #[error("host unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("invalid host transition from {0}")]
    InvalidTransition(HostState),
    #[error("marshaling failed: {0}")]
    Marshal(String),
    #[error("native call {function} failed with status {status}")]
    NativeCallFailed { function: String, status: i32 },
    #[error("managed exception: {0}")]
    ManagedException(String),
    #[error("no native function registered for {0}")]
    UnknownFunction(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl HostError {
    /// Status code reported across the C ABI. Zero is success.
    pub fn status_code(&self) -> i32 {
        match self {
            HostError::NotInitialized => -1,
            HostError::Unavailable { .. } => -2,
            HostError::InvalidTransition(_) => -3,
            HostError::Marshal(_) => -4,
            HostError::NativeCallFailed { .. } => -5,
            HostError::ManagedException(_) => -6,
            HostError::UnknownFunction(_) => -7,
            HostError::Backend(_) => -8,
        }
    }

    pub(crate) fn marshal(message: impl Into<String>) -> Self {
        HostError::Marshal(message.into())
    }
}

//! Bridge error types

use std::path::PathBuf;

use thiserror::Error;

use crate::inference::engine::EngineError;

/// Errors from loading or unloading a model
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Model file is corrupt or unsupported: {0}")]
    Corrupt(String),

    #[error("Not enough memory to load model: {0}")]
    OutOfMemory(String),

    #[error("Session is busy loading or generating")]
    Busy,
}

impl From<EngineError> for LoadError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(path) => LoadError::NotFound(path),
            EngineError::OutOfMemory(detail) => LoadError::OutOfMemory(detail),
            EngineError::Corrupt(detail) => LoadError::Corrupt(detail),
            other => LoadError::Corrupt(other.to_string()),
        }
    }
}

/// Errors from starting a generation run
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("No model loaded")]
    NotReady,

    #[error("A generation is already in progress")]
    Busy,

    #[error("Engine failure: {0}")]
    EngineFailure(String),
}

impl From<EngineError> for GenerateError {
    fn from(e: EngineError) -> Self {
        GenerateError::EngineFailure(e.to_string())
    }
}

/// Delivery outcome for an event nobody was listening for. Not fatal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("No listener registered")]
    NoListener,
}

/// Errors returned synchronously by the session controller
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error("Session controller is shut down")]
    Closed,

    #[error("Worker error: {0}")]
    Worker(String),
}

//! Persistent storage
//!
//! The bridge persists nothing about models or runs. Only user settings live on disk.

pub mod settings;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not determine a data directory for this platform")]
    NoDataDir,
}

/// Platform data directory, e.g. `~/.local/share/llamabridge` on Linux
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "LlamaBridge", "LlamaBridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}

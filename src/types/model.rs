//! Model types
//!
//! Defines metadata describing the currently loaded model.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information about a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Display name of the model (file stem)
    pub name: String,
    /// Path the model was loaded from
    pub path: String,
    /// Model file size in bytes (0 if unknown)
    pub size_bytes: u64,
    /// When the load completed
    pub loaded_at: DateTime<Utc>,
}

impl ModelInfo {
    /// Builds model info for a file that was just loaded
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        Self {
            name,
            path: path.to_string_lossy().to_string(),
            size_bytes,
            loaded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_from_missing_path() {
        let info = ModelInfo::from_path(Path::new("/nowhere/qwen2-7b.Q4_K_M.gguf"));
        assert_eq!(info.name, "qwen2-7b.Q4_K_M");
        assert_eq!(info.path, "/nowhere/qwen2-7b.Q4_K_M.gguf");
        assert_eq!(info.size_bytes, 0);
    }

    #[test]
    fn test_info_reads_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        std::fs::write(&path, [0u8; 128]).unwrap();

        let info = ModelInfo::from_path(&path);
        assert_eq!(info.name, "tiny");
        assert_eq!(info.size_bytes, 128);
    }
}

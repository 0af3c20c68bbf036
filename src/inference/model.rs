//! GGUF model file validation
//!
//! Cheap header checks run before handing a file to the native loader, so a missing or
//! truncated download is reported precisely instead of as a generic load failure.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Oldest and newest container versions we accept
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read model file: {0}")]
    Io(#[from] io::Error),

    #[error("File too small to be a GGUF model")]
    Truncated,

    #[error("Invalid GGUF magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
}

/// Header fields read during validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Validates the GGUF header of `path`
pub fn validate_gguf(path: &Path) -> Result<GgufMetadata, ModelError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ModelError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    // magic (4) + version (4) + tensor count (8) + kv count (8)
    let mut header = [0u8; 24];
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ModelError::Truncated,
        _ => ModelError::Io(e),
    })?;

    let magic = [header[0], header[1], header[2], header[3]];
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

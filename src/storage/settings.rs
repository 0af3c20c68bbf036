//! Settings storage
//!
//! User preferences for the bridge binary, persisted as JSON in the data directory.

use crate::inference::engine::GenerationParams;
use crate::storage::{get_data_dir, StorageError};
use crate::types::config::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Context sizes the engine is configured with
const VALID_CONTEXT_SIZES: [u32; 7] = [2048, 4096, 8192, 16384, 32768, 65536, 131072];

/// Bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Maximum number of tokens to generate per message
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Sampling seed (0 = random per run)
    #[serde(default)]
    pub seed: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Events buffered between the worker and the listener
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Last loaded model path (for auto-loading on startup)
    #[serde(default)]
    pub last_model_path: Option<String>,
    /// Auto-load last model on startup
    #[serde(default = "default_auto_load")]
    pub auto_load_model: bool,
}

fn default_auto_load() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    BridgeConfig::default().channel_capacity
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 2048,
            context_size: 8192,
            seed: 0,
            gpu_layers: 99, // Offload all layers when a GPU backend is compiled in
            channel_capacity: default_channel_capacity(),
            last_model_path: None,
            auto_load_model: true,
        }
    }
}

impl BridgeSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }

        self.max_tokens = self.max_tokens.clamp(1, 65536);

        if !VALID_CONTEXT_SIZES.contains(&self.context_size) {
            let snapped = VALID_CONTEXT_SIZES
                .iter()
                .copied()
                .min_by_key(|&size| (i64::from(size) - i64::from(self.context_size)).abs())
                .unwrap_or(4096);
            tracing::warn!(
                "Context size {} is not supported, using {}",
                self.context_size,
                snapped
            );
            self.context_size = snapped;
        }

        // Can't generate more than the context holds
        if self.max_tokens > self.context_size {
            self.max_tokens = self.context_size / 2;
        }

        self.channel_capacity = self.channel_capacity.clamp(1, 4096);

        if matches!(&self.last_model_path, Some(p) if p.trim().is_empty()) {
            self.last_model_path = None;
        }
    }

    /// Runtime configuration for the session controller
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            channel_capacity: self.channel_capacity,
            ..BridgeConfig::default()
        }
    }

    /// Sampling parameters for the engine
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
            max_context_size: self.context_size,
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> BridgeSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            BridgeSettings::default()
        }
    }
}

/// Load and validate settings from `path`, defaulting when the file is absent
pub fn load_settings_from(path: &Path) -> Result<BridgeSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(BridgeSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: BridgeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &BridgeSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &BridgeSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_p, 0.9);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.channel_capacity, 64);
        assert!(settings.auto_load_model);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = BridgeSettings::default();

        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        settings.top_p = 2.0;
        settings.top_k = 0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.top_k, 40);

        settings.context_size = 5000;
        settings.max_tokens = 9000;
        settings.validate();
        assert_eq!(settings.context_size, 4096);
        assert_eq!(settings.max_tokens, 2048);

        settings.channel_capacity = 0;
        settings.last_model_path = Some("  ".into());
        settings.validate();
        assert_eq!(settings.channel_capacity, 1);
        assert!(settings.last_model_path.is_none());
    }

    #[test]
    fn test_conversions() {
        let settings = BridgeSettings {
            channel_capacity: 8,
            seed: 42,
            ..BridgeSettings::default()
        };

        let config = settings.bridge_config();
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.worker_thread_name, "llamabridge-worker");

        let params = settings.generation_params();
        assert_eq!(params.seed, 42);
        assert_eq!(params.max_context_size, settings.context_size);
        assert_eq!(params.max_tokens, settings.max_tokens);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = BridgeSettings {
            temperature: 1.2,
            last_model_path: Some("/models/phi.gguf".into()),
            ..BridgeSettings::default()
        };
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.temperature, 1.2);
        assert_eq!(loaded.last_model_path.as_deref(), Some("/models/phi.gguf"));
    }

    #[test]
    fn test_missing_and_partial_files() {
        let dir = TempDir::new().unwrap();

        let missing = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing.context_size, BridgeSettings::default().context_size);

        // Fields added later fall back to their defaults
        let path = dir.path().join("old.json");
        fs::write(
            &path,
            r#"{"temperature":0.2,"top_p":0.5,"top_k":10,"max_tokens":100,"context_size":2048,"gpu_layers":0}"#,
        )
        .unwrap();
        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.top_k, 10);
        assert_eq!(loaded.channel_capacity, 64);
        assert!(loaded.auto_load_model);

        fs::write(&path, "not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(StorageError::Json(_))));
    }
}

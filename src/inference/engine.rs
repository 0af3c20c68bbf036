//! Inference engine boundary
//!
//! An engine loads model files into opaque handles and streams generated text through a
//! callback. Engines run entirely on the bridge's background worker; the callback only
//! hands text to the token channel and tells the engine whether to keep going.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::inference::model::ModelError;

/// Errors that can occur at the engine boundary
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Model file is corrupt or unsupported: {0}")]
    Corrupt(String),

    #[error("Not enough memory to load model: {0}")]
    OutOfMemory(String),

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::NotFound(path) => EngineError::NotFound(path),
            other => EngineError::Corrupt(other.to_string()),
        }
    }
}

/// Callback invoked once per generated text fragment.
///
/// Returning `ControlFlow::Break` asks the engine to stop generating.
pub type TokenSink<'a> = dyn FnMut(&str) -> ControlFlow<()> + Send + 'a;

/// Why an engine stopped producing tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model emitted an end-of-generation token
    EndOfGeneration,
    /// The token budget was exhausted
    MaxTokens,
    /// The token sink asked to stop
    Stopped,
}

/// Summary returned by a finished generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Number of fragments handed to the sink
    pub tokens: u32,
    pub stop_reason: StopReason,
}

/// Generation parameters for inference
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// Context window size
    pub max_context_size: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            seed: 0,
            max_context_size: 4096,
        }
    }
}

/// An opaque inference runtime.
///
/// `load` and `generate` may block for a long time; the bridge only ever calls them from
/// its background worker, and never calls `generate` on a handle concurrently.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Loaded model resource
    type Handle: Send + 'static;

    fn load(&self, path: &Path) -> Result<Self::Handle, EngineError>;

    fn generate(
        &self,
        handle: &Self::Handle,
        prompt: &str,
        on_token: &mut TokenSink<'_>,
    ) -> Result<Completion, EngineError>;

    /// Frees a handle. The default simply drops it.
    fn release(&self, handle: Self::Handle) {
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_params_default() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 512);
        assert!((params.temperature - 0.7).abs() < 0.001);
        assert_eq!(params.top_k, 40);
        assert!((params.top_p - 0.95).abs() < 0.001);
    }

    #[test]
    fn test_model_error_mapping() {
        let err: EngineError = ModelError::NotFound(PathBuf::from("a.gguf")).into();
        assert_eq!(err, EngineError::NotFound(PathBuf::from("a.gguf")));

        let err: EngineError = ModelError::InvalidMagic([0, 1, 2, 3]).into();
        assert!(matches!(err, EngineError::Corrupt(_)));
    }
}

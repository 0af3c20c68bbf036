//! LLM inference engines
//!
//! The bridge talks to the native runtime only through [`InferenceEngine`].

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod scripted;

// Re-export main types for convenience
pub use engine::{Completion, EngineError, GenerationParams, InferenceEngine, StopReason, TokenSink};
#[cfg(feature = "llama")]
pub use llama::LlamaCppEngine;
pub use model::{validate_gguf, GgufMetadata, ModelError, GGUF_MAGIC};
pub use scripted::ScriptedEngine;

//! LlamaBridge Library
//!
//! Streams tokens from a local GGUF model to an application shell. Model work runs on a
//! background worker; results reach the shell only as events delivered to its listener.

pub mod bridge;
pub mod inference;
pub mod storage;
pub mod types;

pub use bridge::{BridgeCommand, BridgeError, Listener, ListenerRegistry, SessionController, SessionState};
pub use inference::{InferenceEngine, ScriptedEngine};
pub use types::{BridgeConfig, BridgeEvent, RunId};

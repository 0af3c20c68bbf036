//! Shared type definitions
//!
//! Data carried between the session, the token channel and listeners.

pub mod config;
pub mod event;
pub mod model;
pub mod token;

pub use config::BridgeConfig;
pub use event::BridgeEvent;
pub use model::ModelInfo;
pub use token::{GenerationRequest, RunId, StreamItem, TerminalSignal, Token};

//! Token stream types
//!
//! A run produces a sequence of [`Token`]s closed by exactly one [`TerminalSignal`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one generation run, from acceptance to its terminal signal
pub type RunId = Uuid;

/// A prompt submitted for generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

/// A generated text fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Text fragment as produced by the engine
    pub text: String,
    /// Position within the run, starting at 0
    pub sequence: u64,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "camelCase")]
pub enum TerminalSignal {
    Completed,
    Failed(String),
    Cancelled,
}

/// One item of a run's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Token(Token),
    Terminal(TerminalSignal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_signal_serialization() {
        let json = serde_json::to_string(&TerminalSignal::Failed("out of context".into())).unwrap();
        assert_eq!(json, r#"{"outcome":"failed","reason":"out of context"}"#);

        let json = serde_json::to_string(&TerminalSignal::Cancelled).unwrap();
        assert_eq!(json, r#"{"outcome":"cancelled"}"#);
    }

    #[test]
    fn test_request_from_str() {
        let request = GenerationRequest::new("hello");
        assert_eq!(request.prompt, "hello");
    }
}

//! Listener-facing events
//!
//! Everything a listener ever sees is a [`BridgeEvent`]. The serialized form uses the
//! method names a shell forwards over its own channel (`modelLoaded`, `tokenReceived`, ...).

use serde::{Deserialize, Serialize};

use crate::types::model::ModelInfo;
use crate::types::token::{RunId, StreamItem, TerminalSignal, Token};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    ModelLoaded { path: String },
    #[serde(rename_all = "camelCase")]
    LoadFailed { reason: String },
    ModelUnloaded,
    #[serde(rename_all = "camelCase")]
    TokenReceived {
        run_id: RunId,
        text: String,
        sequence: u64,
    },
    #[serde(rename_all = "camelCase")]
    GenerationComplete { run_id: RunId },
    #[serde(rename_all = "camelCase")]
    GenerationFailed { run_id: RunId, reason: String },
    #[serde(rename_all = "camelCase")]
    GenerationCancelled { run_id: RunId },
}

impl BridgeEvent {
    /// Name of the shell-side method this event maps to
    pub fn method_name(&self) -> &'static str {
        match self {
            BridgeEvent::ModelLoaded { .. } => "modelLoaded",
            BridgeEvent::LoadFailed { .. } => "loadFailed",
            BridgeEvent::ModelUnloaded => "modelUnloaded",
            BridgeEvent::TokenReceived { .. } => "tokenReceived",
            BridgeEvent::GenerationComplete { .. } => "generationComplete",
            BridgeEvent::GenerationFailed { .. } => "generationFailed",
            BridgeEvent::GenerationCancelled { .. } => "generationCancelled",
        }
    }

    /// True for the event that closes a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeEvent::GenerationComplete { .. }
                | BridgeEvent::GenerationFailed { .. }
                | BridgeEvent::GenerationCancelled { .. }
        )
    }

    /// Run this event belongs to, if any
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            BridgeEvent::TokenReceived { run_id, .. }
            | BridgeEvent::GenerationComplete { run_id }
            | BridgeEvent::GenerationFailed { run_id, .. }
            | BridgeEvent::GenerationCancelled { run_id } => Some(*run_id),
            _ => None,
        }
    }

    pub fn model_loaded(info: &ModelInfo) -> Self {
        BridgeEvent::ModelLoaded {
            path: info.path.clone(),
        }
    }

    pub fn from_stream(run_id: RunId, item: StreamItem) -> Self {
        match item {
            StreamItem::Token(Token { text, sequence }) => BridgeEvent::TokenReceived {
                run_id,
                text,
                sequence,
            },
            StreamItem::Terminal(TerminalSignal::Completed) => {
                BridgeEvent::GenerationComplete { run_id }
            }
            StreamItem::Terminal(TerminalSignal::Failed(reason)) => {
                BridgeEvent::GenerationFailed { run_id, reason }
            }
            StreamItem::Terminal(TerminalSignal::Cancelled) => {
                BridgeEvent::GenerationCancelled { run_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_event_wire_format() {
        let run_id = Uuid::nil();
        let event = BridgeEvent::TokenReceived {
            run_id,
            text: "He".to_string(),
            sequence: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "tokenReceived");
        assert_eq!(json["text"], "He");
        assert_eq!(json["sequence"], 0);
        assert_eq!(json["runId"], run_id.to_string());
        assert_eq!(event.method_name(), "tokenReceived");
    }

    #[test]
    fn test_terminal_mapping() {
        let run_id = Uuid::new_v4();
        let event = BridgeEvent::from_stream(
            run_id,
            StreamItem::Terminal(TerminalSignal::Failed("boom".into())),
        );
        assert!(event.is_terminal());
        assert_eq!(event.run_id(), Some(run_id));
        assert_eq!(event.method_name(), "generationFailed");

        let loaded = BridgeEvent::ModelLoaded {
            path: "model.gguf".into(),
        };
        assert!(!loaded.is_terminal());
        assert_eq!(loaded.run_id(), None);
    }
}

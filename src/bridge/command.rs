//! Shell commands
//!
//! Decodes the requests an application shell forwards to the bridge, either as a named
//! method call with an argument map or as a self-describing JSON object with an
//! `action` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BridgeCommand {
    #[serde(rename_all = "camelCase")]
    LoadModel { model_path: String },
    SendMessage { message: String },
    UnloadModel,
    CancelGeneration,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid {0}")]
    InvalidArgument(&'static str),

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("Malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl BridgeCommand {
    /// Decodes a method call such as `loadModel` with `{"path": "..."}`
    pub fn from_method_call(method: &str, args: &Value) -> Result<Self, CommandError> {
        match method {
            "loadModel" => string_arg(args, "path")
                .map(|model_path| BridgeCommand::LoadModel { model_path })
                .ok_or(CommandError::InvalidArgument("model path")),
            "sendMessage" => string_arg(args, "message")
                .map(|message| BridgeCommand::SendMessage { message })
                .ok_or(CommandError::InvalidArgument("message")),
            "unloadModel" => Ok(BridgeCommand::UnloadModel),
            "cancelGeneration" => Ok(BridgeCommand::CancelGeneration),
            other => Err(CommandError::NotImplemented(other.to_string())),
        }
    }

    /// Decodes `{"action": "loadModel", "modelPath": "..."}` style commands
    pub fn from_json(json: &str) -> Result<Self, CommandError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

//! Command-line shell for the bridge
//!
//! Loads a GGUF model, then streams a reply for every prompt read from stdin.

use std::io::Write;
use std::sync::Arc;

use llamabridge::bridge::{Listener, SessionController};
use llamabridge::inference::LlamaCppEngine;
use llamabridge::storage::settings::{load_settings, save_settings};
use llamabridge::types::BridgeEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: llamabridge <model.gguf>";

/// Writes tokens straight to stdout and hands every other event to the prompt loop
struct StdoutListener {
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl Listener for StdoutListener {
    fn on_event(&self, event: &BridgeEvent) {
        if let BridgeEvent::TokenReceived { text, .. } = event {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        } else {
            let _ = self.events.send(event.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llamabridge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = load_settings();
    let model_path = match std::env::args().nth(1) {
        Some(path) => path,
        None if settings.auto_load_model => settings.last_model_path.clone().ok_or(USAGE)?,
        None => return Err(USAGE.into()),
    };

    let engine = Arc::new(LlamaCppEngine::new(
        settings.generation_params(),
        settings.gpu_layers,
    )?);
    let controller = SessionController::new(engine, &settings.bridge_config())?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let listener = Arc::new(StdoutListener { events: events_tx });
    controller.set_listener(&listener);

    controller.load_model(&model_path)?;
    match events.recv().await {
        Some(BridgeEvent::ModelLoaded { path }) => {
            tracing::info!("Model ready: {}", path);
            settings.last_model_path = Some(model_path);
            if let Err(e) = save_settings(&settings) {
                tracing::warn!("Failed to remember model path: {}", e);
            }
        }
        Some(BridgeEvent::LoadFailed { reason }) => {
            controller.shutdown().await;
            return Err(reason.into());
        }
        other => {
            controller.shutdown().await;
            return Err(format!("unexpected event while loading: {other:?}").into());
        }
    }

    eprintln!("Type a prompt and press enter. An empty line quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            break;
        }

        if let Err(e) = controller.send_message(prompt) {
            eprintln!("{e}");
            continue;
        }

        // Ctrl-C cancels the reply; the run still ends with its terminal event
        let mut cancelled = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) if event.is_terminal() => {
                        match event {
                            BridgeEvent::GenerationFailed { reason, .. } => eprintln!("\n[failed: {reason}]"),
                            BridgeEvent::GenerationCancelled { .. } => eprintln!("\n[cancelled]"),
                            _ => println!(),
                        }
                        break;
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::signal::ctrl_c(), if !cancelled => {
                    cancelled = controller.cancel_generation();
                }
            }
        }
    }

    controller.shutdown().await;
    Ok(())
}

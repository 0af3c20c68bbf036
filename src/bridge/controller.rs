//! Session controller
//!
//! Public facade of the bridge. Requests are validated against the session state on the
//! caller's thread, then queued to a dedicated worker thread that owns all blocking model
//! work. Results come back only as [`BridgeEvent`]s delivered to the registered listener.
//!
//! # Architecture
//!
//! ```text
//! caller ──load_model/send_message──▶ worker thread ──TokenChannel──▶ delivery task ──▶ listener
//! ```
//!
//! The worker thread is a plain OS thread since engine calls block for seconds to minutes.
//! The delivery task runs on the tokio runtime the controller was created in.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::channel::{ChannelCounts, TokenChannel, TokenProducer};
use crate::bridge::command::BridgeCommand;
use crate::bridge::error::BridgeError;
use crate::bridge::registry::{Listener, ListenerId, ListenerRegistry};
use crate::bridge::session::{GenerationPermit, LoadPermit, ModelSession, SessionState};
use crate::inference::engine::InferenceEngine;
use crate::types::config::BridgeConfig;
use crate::types::event::BridgeEvent;
use crate::types::model::ModelInfo;
use crate::types::token::{GenerationRequest, RunId};

/// Commands sent to the worker thread
enum WorkerCommand<E: InferenceEngine> {
    Load {
        path: PathBuf,
        permit: LoadPermit<E>,
    },
    Unload,
    Generate {
        request: GenerationRequest,
        permit: GenerationPermit<E>,
        producer: TokenProducer,
    },
    Shutdown,
}

/// The run currently queued or in flight
struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionController<E: InferenceEngine> {
    session: ModelSession<E>,
    registry: ListenerRegistry,
    channel: Option<TokenChannel>,
    delivery: Option<tokio::task::JoinHandle<()>>,
    command_tx: Sender<WorkerCommand<E>>,
    worker_handle: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    active: ActiveSlot,
}

impl<E: InferenceEngine> SessionController<E> {
    /// Starts the worker thread and the delivery task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(engine: Arc<E>, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let runtime = Handle::try_current()
            .map_err(|e| BridgeError::Worker(format!("no tokio runtime: {e}")))?;

        let registry = ListenerRegistry::new();
        let (channel, delivery) =
            TokenChannel::spawn_on(&runtime, config.channel_capacity, registry.clone());
        let session = ModelSession::new(engine);
        let shutdown = CancellationToken::new();
        let active: ActiveSlot = Arc::new(Mutex::new(None));

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand<E>>();
        let worker = Worker {
            session: session.clone(),
            channel: channel.clone(),
            shutdown: shutdown.clone(),
            active: active.clone(),
        };
        let worker_handle = thread::Builder::new()
            .name(config.worker_thread_name.clone())
            .spawn(move || worker.run(command_rx))
            .map_err(|e| BridgeError::Worker(e.to_string()))?;

        tracing::info!(
            "Session controller started (worker {:?}, channel capacity {})",
            config.worker_thread_name,
            channel.capacity()
        );

        Ok(Self {
            session,
            registry,
            channel: Some(channel),
            delivery: Some(delivery),
            command_tx,
            worker_handle: Some(worker_handle),
            shutdown,
            active,
        })
    }

    /// Registration point shared with the shell
    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn set_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: Listener + 'static,
    {
        self.registry.set(listener)
    }

    pub fn clear_listener(&self) {
        self.registry.clear();
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.session.model_info()
    }

    pub fn channel_stats(&self) -> ChannelCounts {
        self.channel
            .as_ref()
            .map(TokenChannel::counts)
            .unwrap_or_default()
    }

    /// Queues a model load. The listener later receives `modelLoaded` or `loadFailed`.
    pub fn load_model(&self, path: impl AsRef<Path>) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let permit = self.session.begin_load()?;
        let path = path.as_ref().to_path_buf();

        tracing::info!("Load requested: {}", path.display());
        self.command_tx
            .send(WorkerCommand::Load { path, permit })
            .map_err(|_| BridgeError::Closed)
    }

    /// Queues a generation run and returns its id. Fails immediately with `NotReady`
    /// or `Busy` without scheduling anything.
    pub fn send_message(&self, text: impl Into<String>) -> Result<RunId, BridgeError> {
        self.ensure_open()?;
        let channel = self.channel.as_ref().ok_or(BridgeError::Closed)?;
        let permit = self.session.begin_generate()?;

        let run_id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let producer = channel.producer(run_id, cancel.clone());
        *lock(&self.active) = Some(ActiveRun { run_id, cancel });

        if self.registry.get().is_none() {
            tracing::debug!("No listener registered for run {}", run_id);
        }

        let command = WorkerCommand::Generate {
            request: GenerationRequest::new(text),
            permit,
            producer,
        };
        if let Err(mpsc::SendError(command)) = self.command_tx.send(command) {
            lock(&self.active).take();
            // The caller gets no run id, so the run must not emit a terminal either
            if let WorkerCommand::Generate { producer, .. } = command {
                producer.discard();
            }
            return Err(BridgeError::Closed);
        }

        tracing::info!("Run {} queued", run_id);
        Ok(run_id)
    }

    /// Queues release of the loaded model. The listener later receives `modelUnloaded`.
    pub fn unload_model(&self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if !self.session.begin_unload()? {
            tracing::debug!("Unload requested with no model loaded");
        }
        self.command_tx
            .send(WorkerCommand::Unload)
            .map_err(|_| BridgeError::Closed)
    }

    /// Cancels the queued or in-flight run. Returns false if there is none.
    pub fn cancel_generation(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(run) => {
                tracing::info!("Cancelling run {}", run.run_id);
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Routes a decoded shell command and returns its acknowledgement
    pub fn dispatch(&self, command: BridgeCommand) -> Result<String, BridgeError> {
        match command {
            BridgeCommand::LoadModel { model_path } => {
                self.load_model(&model_path)?;
                Ok(format!("Model loading started at path: {model_path}"))
            }
            BridgeCommand::SendMessage { message } => {
                let run_id = self.send_message(message.clone())?;
                tracing::debug!("Message dispatched as run {}", run_id);
                Ok(format!("Message sending started: {message}"))
            }
            BridgeCommand::UnloadModel => {
                self.unload_model()?;
                Ok("Model unload started".to_string())
            }
            BridgeCommand::CancelGeneration => {
                if self.cancel_generation() {
                    Ok("Generation cancelled".to_string())
                } else {
                    Ok("No generation in progress".to_string())
                }
            }
        }
    }

    /// Cancels any run and tells the worker to stop, without waiting.
    ///
    /// Further requests fail with [`BridgeError::Closed`].
    pub fn begin_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Session controller shutting down");
            self.shutdown.cancel();
        }
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
    }

    /// Shuts down and waits until the worker has exited and every pending event has been
    /// handed to the listener.
    pub async fn shutdown(mut self) -> ChannelCounts {
        self.begin_shutdown();

        if let Some(worker) = self.worker_handle.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("Worker thread panicked"),
                Err(e) => tracing::error!("Failed to join worker thread: {}", e),
            }
        }

        let counts = match (self.channel.take(), self.delivery.take()) {
            (Some(channel), Some(delivery)) => channel.close(delivery).await,
            _ => ChannelCounts::default(),
        };
        tracing::info!(
            "Session controller stopped ({} events delivered, {} dropped)",
            counts.delivered,
            counts.dropped
        );
        counts
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.shutdown.is_cancelled() {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<E: InferenceEngine> Drop for SessionController<E> {
    fn drop(&mut self) {
        // The worker exits on its own; joining here could block an async thread
        if self.worker_handle.is_some() {
            self.begin_shutdown();
        }
    }
}

/// State owned by the worker thread
struct Worker<E: InferenceEngine> {
    session: ModelSession<E>,
    channel: TokenChannel,
    shutdown: CancellationToken,
    active: ActiveSlot,
}

impl<E: InferenceEngine> Worker<E> {
    fn run(self, command_rx: Receiver<WorkerCommand<E>>) {
        tracing::info!("Bridge worker started");
        loop {
            match command_rx.recv() {
                Ok(WorkerCommand::Shutdown) => {
                    tracing::info!("Worker thread shutting down");
                    break;
                }
                Ok(command) => self.handle(command),
                Err(_) => {
                    tracing::debug!("Command channel closed, worker exiting");
                    break;
                }
            }
        }

        // Requests that raced with shutdown still get their one notification
        while let Ok(command) = command_rx.try_recv() {
            self.handle(command);
        }
        tracing::info!("Bridge worker stopped");
    }

    fn handle(&self, command: WorkerCommand<E>) {
        match command {
            WorkerCommand::Load { path, permit } => self.load(&path, permit),
            WorkerCommand::Unload => {
                self.session.release_model();
                self.channel.notify(BridgeEvent::ModelUnloaded);
            }
            WorkerCommand::Generate {
                request,
                permit,
                producer,
            } => self.generate(request, permit, producer),
            WorkerCommand::Shutdown => {}
        }
    }

    fn load(&self, path: &Path, permit: LoadPermit<E>) {
        if self.shutdown.is_cancelled() {
            drop(permit);
            self.channel.notify(BridgeEvent::LoadFailed {
                reason: "session shut down".to_string(),
            });
            return;
        }

        let event = match permit.run(path) {
            Ok(info) => BridgeEvent::model_loaded(&info),
            Err(e) => BridgeEvent::LoadFailed {
                reason: e.to_string(),
            },
        };
        self.channel.notify(event);
    }

    fn generate(&self, request: GenerationRequest, permit: GenerationPermit<E>, producer: TokenProducer) {
        let run_id = producer.run_id();
        tracing::info!("Run {} started", run_id);

        let signal = permit.run(request, producer);

        let mut active = lock(&self.active);
        if active.as_ref().map(|run| run.run_id) == Some(run_id) {
            *active = None;
        }
        tracing::info!("Run {} ended: {:?}", run_id, signal);
    }
}

//! Model session
//!
//! Owns at most one loaded model handle and the session state machine:
//!
//! ```text
//! Unloaded -> Loading -> Ready -> Generating -> Ready
//!                |                     (always back to Ready)
//!                +-> Unloaded on failure
//! ```
//!
//! Work is split in two phases. `begin_*` performs the state transition immediately and
//! hands back an owned permit; the permit does the blocking work later on the background
//! worker. Dropping a permit that never ran restores a consistent state.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::bridge::channel::TokenProducer;
use crate::bridge::error::{GenerateError, LoadError};
use crate::bridge::panic_message;
use crate::inference::engine::InferenceEngine;
use crate::types::model::ModelInfo;
use crate::types::token::{GenerationRequest, TerminalSignal};

/// Current state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared<E: InferenceEngine> {
    engine: Arc<E>,
    state: Mutex<SessionState>,
    handle: Mutex<Option<E::Handle>>,
    info: Mutex<Option<ModelInfo>>,
}

impl<E: InferenceEngine> Shared<E> {
    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        tracing::debug!("Session state {:?} -> {:?}", *state, next);
        *state = next;
    }

    fn release_handle(&self) -> bool {
        let handle = lock(&self.handle).take();
        *lock(&self.info) = None;
        match handle {
            Some(handle) => {
                self.engine.release(handle);
                tracing::info!("Model handle released");
                true
            }
            None => false,
        }
    }
}

/// Shared handle to one model session
pub struct ModelSession<E: InferenceEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: InferenceEngine> Clone for ModelSession<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: InferenceEngine> ModelSession<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                state: Mutex::new(SessionState::Unloaded),
                handle: Mutex::new(None),
                info: Mutex::new(None),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.shared.engine
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Information about the loaded model, if any
    pub fn model_info(&self) -> Option<ModelInfo> {
        lock(&self.shared.info).clone()
    }

    /// Moves `Unloaded | Ready` to `Loading`
    pub fn begin_load(&self) -> Result<LoadPermit<E>, LoadError> {
        let mut state = lock(&self.shared.state);
        match *state {
            SessionState::Unloaded | SessionState::Ready => {
                tracing::debug!("Session state {:?} -> Loading", *state);
                *state = SessionState::Loading;
                Ok(LoadPermit {
                    shared: self.shared.clone(),
                    done: false,
                })
            }
            SessionState::Loading | SessionState::Generating => Err(LoadError::Busy),
        }
    }

    /// Loads `path`, replacing any loaded model. Blocks for the whole load.
    pub fn load(&self, path: &Path) -> Result<ModelInfo, LoadError> {
        self.begin_load()?.run(path)
    }

    /// Moves `Ready` to `Generating`
    pub fn begin_generate(&self) -> Result<GenerationPermit<E>, GenerateError> {
        let mut state = lock(&self.shared.state);
        match *state {
            SessionState::Ready => {
                tracing::debug!("Session state Ready -> Generating");
                *state = SessionState::Generating;
                Ok(GenerationPermit {
                    shared: self.shared.clone(),
                })
            }
            SessionState::Generating => Err(GenerateError::Busy),
            SessionState::Unloaded | SessionState::Loading => Err(GenerateError::NotReady),
        }
    }

    /// Runs one generation into `producer`. Blocks until the run has ended.
    ///
    /// Must be called from a thread that is not driving async tasks.
    pub fn generate(
        &self,
        request: GenerationRequest,
        producer: TokenProducer,
    ) -> Result<TerminalSignal, GenerateError> {
        match self.begin_generate() {
            Ok(permit) => Ok(permit.run(request, producer)),
            Err(e) => {
                producer.discard();
                Err(e)
            }
        }
    }

    /// Moves `Ready` to `Unloaded`. Returns whether a model was loaded; the handle itself
    /// is freed by [`ModelSession::release_model`].
    pub fn begin_unload(&self) -> Result<bool, LoadError> {
        let mut state = lock(&self.shared.state);
        match *state {
            SessionState::Ready => {
                tracing::debug!("Session state Ready -> Unloaded");
                *state = SessionState::Unloaded;
                Ok(true)
            }
            SessionState::Unloaded => Ok(false),
            SessionState::Loading | SessionState::Generating => Err(LoadError::Busy),
        }
    }

    /// Frees the model handle, if one is held
    pub fn release_model(&self) -> bool {
        self.shared.release_handle()
    }

    pub fn unload(&self) -> Result<(), LoadError> {
        if self.begin_unload()? {
            self.release_model();
        }
        Ok(())
    }
}

/// A reserved load. Dropping it unexecuted leaves the session `Unloaded`.
pub struct LoadPermit<E: InferenceEngine> {
    shared: Arc<Shared<E>>,
    done: bool,
}

impl<E: InferenceEngine> LoadPermit<E> {
    pub fn run(mut self, path: &Path) -> Result<ModelInfo, LoadError> {
        self.done = true;
        let shared = self.shared.clone();

        if shared.release_handle() {
            tracing::debug!("Released previous model before loading {}", path.display());
        }

        let started = Instant::now();
        let result = match panic::catch_unwind(AssertUnwindSafe(|| shared.engine.load(path))) {
            Ok(result) => result.map_err(LoadError::from),
            Err(payload) => Err(LoadError::Corrupt(format!(
                "engine panicked during load: {}",
                panic_message(payload.as_ref())
            ))),
        };

        match result {
            Ok(handle) => {
                let info = ModelInfo::from_path(path);
                *lock(&shared.handle) = Some(handle);
                *lock(&shared.info) = Some(info.clone());
                shared.set_state(SessionState::Ready);
                tracing::info!(
                    "Model {} loaded in {:.2}s",
                    info.name,
                    started.elapsed().as_secs_f32()
                );
                Ok(info)
            }
            Err(e) => {
                shared.set_state(SessionState::Unloaded);
                tracing::error!("Failed to load {}: {}", path.display(), e);
                Err(e)
            }
        }
    }
}

impl<E: InferenceEngine> Drop for LoadPermit<E> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.release_handle();
            self.shared.set_state(SessionState::Unloaded);
            tracing::debug!("Load abandoned before it ran");
        }
    }
}

/// A reserved generation. The session returns to `Ready` when the permit is dropped,
/// whether or not it ran.
pub struct GenerationPermit<E: InferenceEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: InferenceEngine> GenerationPermit<E> {
    /// Drives the engine, then emits the run's terminal signal before the session
    /// becomes `Ready` again.
    pub fn run(self, request: GenerationRequest, mut producer: TokenProducer) -> TerminalSignal {
        let run_id = producer.run_id();

        let signal = if producer.is_cancelled() {
            tracing::debug!("Run {} cancelled before it started", run_id);
            TerminalSignal::Cancelled
        } else {
            let handle = lock(&self.shared.handle);
            match handle.as_ref() {
                Some(handle) => {
                    let started = Instant::now();
                    let engine = &self.shared.engine;
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        engine.generate(handle, &request.prompt, &mut |text: &str| {
                            producer.push(text)
                        })
                    }));

                    if producer.is_cancelled() {
                        TerminalSignal::Cancelled
                    } else {
                        match result {
                            Ok(Ok(completion)) => {
                                tracing::debug!(
                                    "Run {} finished: {} tokens, {:?}, {:.2}s",
                                    run_id,
                                    producer.produced(),
                                    completion.stop_reason,
                                    started.elapsed().as_secs_f32()
                                );
                                TerminalSignal::Completed
                            }
                            Ok(Err(e)) => {
                                tracing::warn!("Run {} failed: {}", run_id, e);
                                TerminalSignal::Failed(e.to_string())
                            }
                            Err(payload) => {
                                let message = panic_message(payload.as_ref());
                                tracing::error!("Engine panicked during run {}: {}", run_id, message);
                                TerminalSignal::Failed(format!("engine panicked: {message}"))
                            }
                        }
                    }
                }
                None => TerminalSignal::Failed(GenerateError::NotReady.to_string()),
            }
        };

        producer.finish(signal.clone());
        signal
    }
}

impl<E: InferenceEngine> Drop for GenerationPermit<E> {
    fn drop(&mut self) {
        self.shared.set_state(SessionState::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::TokenChannel;
    use crate::bridge::registry::ListenerRegistry;
    use crate::bridge::testing::Forward;
    use crate::inference::engine::EngineError;
    use crate::inference::scripted::ScriptedEngine;
    use crate::types::event::BridgeEvent;
    use std::path::PathBuf;
    use tokio::runtime::Runtime;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Harness {
        _rt: Runtime,
        channel: TokenChannel,
        _listener: Arc<Forward>,
        events: UnboundedReceiver<BridgeEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let rt = Runtime::new().unwrap();
            let registry = ListenerRegistry::new();
            let (channel, _task) = TokenChannel::spawn_on(rt.handle(), 4, registry.clone());
            let (listener, events) = Forward::new();
            registry.set(&listener);
            Self {
                _rt: rt,
                channel,
                _listener: listener,
                events,
            }
        }

        fn producer(&self) -> TokenProducer {
            self.channel.producer(Uuid::new_v4(), CancellationToken::new())
        }

        fn next(&mut self) -> BridgeEvent {
            self.events.blocking_recv().expect("listener channel closed")
        }
    }

    fn loaded(engine: ScriptedEngine) -> (ModelSession<ScriptedEngine>, Arc<ScriptedEngine>) {
        let engine = Arc::new(engine);
        let session = ModelSession::new(engine.clone());
        session.load(Path::new("model.gguf")).unwrap();
        (session, engine)
    }

    #[test]
    fn test_generate_before_load() {
        let harness = Harness::new();
        let engine = Arc::new(ScriptedEngine::new(["x"]));
        let session = ModelSession::new(engine.clone());

        let err = session
            .generate(GenerationRequest::new("hello"), harness.producer())
            .unwrap_err();
        assert_eq!(err, GenerateError::NotReady);
        assert_eq!(engine.generate_calls(), 0);
        assert_eq!(session.state(), SessionState::Unloaded);
    }

    #[test]
    fn test_load_replaces_previous_handle() {
        let engine = Arc::new(ScriptedEngine::new(["x"]));
        let session = ModelSession::new(engine.clone());

        let info = session.load(Path::new("first.gguf")).unwrap();
        assert_eq!(info.name, "first");
        assert_eq!(session.state(), SessionState::Ready);

        session.load(Path::new("second.gguf")).unwrap();
        assert_eq!(engine.live_handles(), 1);
        assert_eq!(engine.load_calls(), 2);
        assert_eq!(session.model_info().unwrap().name, "second");
    }

    #[test]
    fn test_failed_load_leaves_unloaded() {
        let engine = Arc::new(
            ScriptedEngine::new(["x"])
                .rejecting("missing.gguf", EngineError::NotFound(PathBuf::from("missing.gguf"))),
        );
        let session = ModelSession::new(engine.clone());
        session.load(Path::new("good.gguf")).unwrap();

        let err = session.load(Path::new("missing.gguf")).unwrap_err();
        assert_eq!(err, LoadError::NotFound(PathBuf::from("missing.gguf")));
        assert_eq!(session.state(), SessionState::Unloaded);
        assert_eq!(engine.live_handles(), 0);
        assert!(session.model_info().is_none());
    }

    #[test]
    fn test_generate_streams_and_returns_to_ready() {
        let mut harness = Harness::new();
        let (session, _engine) = loaded(ScriptedEngine::new(["He", "llo", " there"]));

        let signal = session
            .generate(GenerationRequest::new("hello"), harness.producer())
            .unwrap();
        assert_eq!(signal, TerminalSignal::Completed);
        assert_eq!(session.state(), SessionState::Ready);

        let mut texts = Vec::new();
        for expected in 0..3u64 {
            match harness.next() {
                BridgeEvent::TokenReceived { text, sequence, .. } => {
                    assert_eq!(sequence, expected);
                    texts.push(text);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(texts, vec!["He", "llo", " there"]);
        assert!(matches!(harness.next(), BridgeEvent::GenerationComplete { .. }));
    }

    #[test]
    fn test_busy_while_generating() {
        let (session, engine) = loaded(ScriptedEngine::new(["x"]));

        let permit = session.begin_generate().unwrap();
        assert_eq!(session.state(), SessionState::Generating);
        assert!(matches!(session.begin_generate(), Err(GenerateError::Busy)));
        assert!(matches!(session.begin_load(), Err(LoadError::Busy)));
        assert_eq!(session.unload(), Err(LoadError::Busy));
        assert_eq!(engine.generate_calls(), 0);

        drop(permit);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_engine_failure_becomes_failed_signal() {
        let mut harness = Harness::new();
        let (session, _engine) = loaded(
            ScriptedEngine::new(["partial"]).failing_with(EngineError::Inference("decode".into())),
        );

        let signal = session
            .generate(GenerationRequest::new("hello"), harness.producer())
            .unwrap();
        assert_eq!(signal, TerminalSignal::Failed("Inference failed: decode".into()));
        assert_eq!(session.state(), SessionState::Ready);

        assert!(matches!(harness.next(), BridgeEvent::TokenReceived { .. }));
        assert!(matches!(harness.next(), BridgeEvent::GenerationFailed { .. }));
    }

    #[test]
    fn test_engine_panic_is_contained() {
        let harness = Harness::new();
        let (session, engine) = loaded(ScriptedEngine::new(["a"]).panicking("kernel fault"));

        let signal = session
            .generate(GenerationRequest::new("hello"), harness.producer())
            .unwrap();
        assert_eq!(signal, TerminalSignal::Failed("engine panicked: kernel fault".into()));
        assert_eq!(session.state(), SessionState::Ready);

        // The session stays usable after the panic
        session
            .generate(GenerationRequest::new("again"), harness.producer())
            .unwrap();
        assert_eq!(engine.generate_calls(), 2);
    }

    #[test]
    fn test_cancelled_before_start_skips_engine() {
        let mut harness = Harness::new();
        let (session, engine) = loaded(ScriptedEngine::new(["x"]));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run_id = Uuid::new_v4();
        let producer = harness.channel.producer(run_id, cancel);

        let signal = session.generate(GenerationRequest::new("hello"), producer).unwrap();
        assert_eq!(signal, TerminalSignal::Cancelled);
        assert_eq!(engine.generate_calls(), 0);
        assert_eq!(harness.next(), BridgeEvent::GenerationCancelled { run_id });
    }

    #[test]
    fn test_abandoned_load_permit() {
        let (session, engine) = loaded(ScriptedEngine::new(["x"]));
        let permit = session.begin_load().unwrap();
        assert_eq!(session.state(), SessionState::Loading);
        assert!(matches!(session.begin_generate(), Err(GenerateError::NotReady)));

        drop(permit);
        assert_eq!(session.state(), SessionState::Unloaded);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_unload() {
        let (session, engine) = loaded(ScriptedEngine::new(["x"]));
        session.unload().unwrap();
        assert_eq!(session.state(), SessionState::Unloaded);
        assert_eq!(engine.live_handles(), 0);

        // Unloading twice is a no-op
        session.unload().unwrap();
        assert!(matches!(session.begin_generate(), Err(GenerateError::NotReady)));
    }
}

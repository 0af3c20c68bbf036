//! Deterministic engine
//!
//! Replays a fixed token script for every prompt. Shells use it to exercise the bridge
//! without a model file; it can also pause mid-run, fail, panic, or reject loads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::inference::engine::{Completion, EngineError, InferenceEngine, StopReason, TokenSink};

/// How a scripted run ends once every token has been emitted
#[derive(Debug, Clone)]
enum Ending {
    Complete,
    Fail(EngineError),
    Panic(String),
}

struct Pause {
    after: usize,
    resume: Receiver<()>,
}

/// Handle returned by [`ScriptedEngine::load`]
#[derive(Debug)]
pub struct ScriptedHandle {
    pub path: PathBuf,
}

pub struct ScriptedEngine {
    tokens: Vec<String>,
    ending: Ending,
    pause: Mutex<Option<Pause>>,
    rejected: HashMap<PathBuf, EngineError>,
    foreign_thread: bool,
    load_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    live_handles: AtomicUsize,
}

impl ScriptedEngine {
    /// Engine that emits `tokens` and completes
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ending: Ending::Complete,
            pause: Mutex::new(None),
            rejected: HashMap::new(),
            foreign_thread: false,
            load_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            live_handles: AtomicUsize::new(0),
        }
    }

    /// Fails every run with `error` after the script is emitted
    pub fn failing_with(mut self, error: EngineError) -> Self {
        self.ending = Ending::Fail(error);
        self
    }

    /// Panics after the script is emitted
    pub fn panicking(mut self, message: impl Into<String>) -> Self {
        self.ending = Ending::Panic(message.into());
        self
    }

    /// Makes `load(path)` fail with `error`
    pub fn rejecting(mut self, path: impl Into<PathBuf>, error: EngineError) -> Self {
        self.rejected.insert(path.into(), error);
        self
    }

    /// Invokes the token sink from a separate engine-owned thread
    pub fn on_engine_thread(mut self) -> Self {
        self.foreign_thread = true;
        self
    }

    /// Blocks the next run after `after` tokens until the returned sender fires or is dropped
    pub fn pause_after(&self, after: usize) -> Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.pause.lock().unwrap_or_else(|e| e.into_inner()) = Some(Pause { after, resume: rx });
        tx
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Handles loaded and not yet released
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    fn run_script(&self, on_token: &mut TokenSink<'_>) -> Result<Completion, EngineError> {
        let pause = self.pause.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut emitted = 0u32;

        for (i, text) in self.tokens.iter().enumerate() {
            if let Some(p) = &pause {
                if i == p.after {
                    // Either a resume message or a dropped sender releases the run
                    let _ = p.resume.recv();
                }
            }
            if on_token(text).is_break() {
                tracing::debug!("Scripted run stopped by sink after {} tokens", emitted);
                return Ok(Completion {
                    tokens: emitted,
                    stop_reason: StopReason::Stopped,
                });
            }
            emitted += 1;
        }

        match &self.ending {
            Ending::Complete => Ok(Completion {
                tokens: emitted,
                stop_reason: StopReason::EndOfGeneration,
            }),
            Ending::Fail(e) => Err(e.clone()),
            Ending::Panic(message) => panic!("{}", message),
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    type Handle = ScriptedHandle;

    fn load(&self, path: &Path) -> Result<Self::Handle, EngineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.rejected.get(path) {
            return Err(err.clone());
        }
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedHandle {
            path: path.to_path_buf(),
        })
    }

    fn generate(
        &self,
        handle: &Self::Handle,
        prompt: &str,
        on_token: &mut TokenSink<'_>,
    ) -> Result<Completion, EngineError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Scripted generate on {:?} for {} byte prompt", handle.path, prompt.len());

        if !self.foreign_thread {
            return self.run_script(on_token);
        }

        std::thread::scope(|scope| {
            match scope.spawn(|| self.run_script(on_token)).join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            }
        })
    }

    fn release(&self, handle: Self::Handle) {
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;

    fn collect(engine: &ScriptedEngine, handle: &ScriptedHandle) -> (Vec<String>, Result<Completion, EngineError>) {
        let mut seen = Vec::new();
        let result = engine.generate(handle, "hi", &mut |t: &str| {
            seen.push(t.to_string());
            ControlFlow::Continue(())
        });
        (seen, result)
    }

    #[test]
    fn test_replays_script() {
        let engine = ScriptedEngine::new(["He", "llo"]);
        let handle = engine.load(Path::new("model.gguf")).unwrap();
        let (seen, result) = collect(&engine, &handle);

        assert_eq!(seen, vec!["He", "llo"]);
        assert_eq!(result.unwrap().stop_reason, StopReason::EndOfGeneration);
        assert_eq!(engine.generate_calls(), 1);
        assert_eq!(engine.live_handles(), 1);

        engine.release(handle);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_sink_can_stop() {
        let engine = ScriptedEngine::new(["a", "b", "c"]).on_engine_thread();
        let handle = engine.load(Path::new("model.gguf")).unwrap();
        let mut seen = 0;
        let result = engine
            .generate(&handle, "hi", &mut |_t: &str| {
                seen += 1;
                if seen == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

        assert_eq!(result.tokens, 1);
        assert_eq!(result.stop_reason, StopReason::Stopped);
    }

    #[test]
    fn test_rejected_load() {
        let engine = ScriptedEngine::new(Vec::<String>::new())
            .rejecting("huge.gguf", EngineError::OutOfMemory("needs 40 GB".into()));
        let err = engine.load(Path::new("huge.gguf")).unwrap_err();
        assert!(matches!(err, EngineError::OutOfMemory(_)));
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(engine.load_calls(), 1);
    }

    #[test]
    fn test_failing_engine() {
        let engine = ScriptedEngine::new(["x"]).failing_with(EngineError::Inference("decode".into()));
        let handle = engine.load(Path::new("model.gguf")).unwrap();
        let (seen, result) = collect(&engine, &handle);
        assert_eq!(seen, vec!["x"]);
        assert_eq!(result.unwrap_err(), EngineError::Inference("decode".into()));
    }
}

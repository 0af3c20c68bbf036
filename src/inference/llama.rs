//! llama.cpp engine
//!
//! Core logic for loading GGUF models and running streaming inference with llama-cpp-2.
//!
//! # Threading
//!
//! `LlamaContext` holds raw pointers and is not `Send`, so a fresh context is created
//! inside every `generate` call on the bridge's worker thread and never escapes it.

use std::num::NonZeroU32;
use std::ops::{ControlFlow, Range};
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::engine::{
    Completion, EngineError, GenerationParams, InferenceEngine, StopReason, TokenSink,
};
use crate::inference::model::validate_gguf;

/// Tokens decoded per batch, matching the context's `n_batch`
const PROMPT_BATCH: usize = 512;

/// Inference engine backed by llama.cpp
pub struct LlamaCppEngine {
    backend: LlamaBackend,
    params: GenerationParams,
    gpu_layers: u32,
}

impl LlamaCppEngine {
    /// Initializes the llama.cpp backend.
    ///
    /// The backend can only be initialized once per process.
    pub fn new(params: GenerationParams, gpu_layers: u32) -> Result<Self, EngineError> {
        let backend =
            LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("LlamaBackend initialized ({} GPU layers)", gpu_layers);
        Ok(Self {
            backend,
            params,
            gpu_layers,
        })
    }
}

impl InferenceEngine for LlamaCppEngine {
    type Handle = LlamaModel;

    fn load(&self, path: &Path) -> Result<Self::Handle, EngineError> {
        let metadata = validate_gguf(path)?;
        tracing::debug!("GGUF validation passed for {:?} (v{})", path, metadata.version);

        let model_params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| classify_load_error(e.to_string()))?;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );
        Ok(model)
    }

    fn generate(
        &self,
        model: &Self::Handle,
        prompt: &str,
        on_token: &mut TokenSink<'_>,
    ) -> Result<Completion, EngineError> {
        let prompt = match build_chat_prompt(model, prompt) {
            Ok(chat_prompt) => chat_prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                prompt.to_string()
            }
        };

        let n_ctx = std::cmp::min(self.params.max_context_size, model.n_ctx_train());
        let n_ctx = std::cmp::max(n_ctx, 2048);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(PROMPT_BATCH as u32);

        let mut ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| classify_load_error(format!("Failed to create context: {e}")))?;

        let tokens = model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| EngineError::Inference(format!("Failed to tokenize: {e}")))?;

        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());
        ensure_prompt_fits(tokens.len(), n_ctx)?;

        run_inference(&mut ctx, model, tokens, &self.params, on_token)
    }
}

/// llama.cpp reports allocation failures as plain strings
fn classify_load_error(message: String) -> EngineError {
    let lower = message.to_lowercase();
    if lower.contains("memory") || lower.contains("alloc") {
        EngineError::OutOfMemory(message)
    } else {
        EngineError::Corrupt(message)
    }
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let user_message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[user_message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// The prompt plus at least one generated token must fit in the context
fn ensure_prompt_fits(prompt_len: usize, n_ctx: u32) -> Result<(), EngineError> {
    if prompt_len >= n_ctx as usize {
        return Err(EngineError::Inference(format!(
            "Prompt of {prompt_len} tokens does not fit in a {n_ctx} token context"
        )));
    }
    Ok(())
}

/// Splits a prompt of `len` tokens into decode batches
fn prompt_chunks(len: usize) -> impl Iterator<Item = Range<usize>> {
    (0..len)
        .step_by(PROMPT_BATCH)
        .map(move |start| start..(start + PROMPT_BATCH).min(len))
}

/// Decodes the prompt batch by batch. Only the final token requests logits.
fn decode_prompt(
    ctx: &mut LlamaContext,
    batch: &mut LlamaBatch,
    prompt_tokens: &[LlamaToken],
) -> Result<(), EngineError> {
    let last = prompt_tokens.len().saturating_sub(1);
    for chunk in prompt_chunks(prompt_tokens.len()) {
        batch.clear();
        for pos in chunk {
            batch
                .add(prompt_tokens[pos], pos as i32, &[0], pos == last)
                .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        }
        ctx.decode(batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode prompt: {e}")))?;
    }
    Ok(())
}

/// Runs the decode/sample loop, handing complete UTF-8 fragments to `on_token`
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<LlamaToken>,
    params: &GenerationParams,
    on_token: &mut TokenSink<'_>,
) -> Result<Completion, EngineError> {
    let mut batch = LlamaBatch::new(PROMPT_BATCH, 1);
    decode_prompt(ctx, &mut batch, &prompt_tokens)?;

    let seed = if params.seed == 0 {
        rand_seed()
    } else {
        params.seed
    };

    let mut sampler = if params.temperature < 0.01 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(params.top_k as i32),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let mut n_decoded = prompt_tokens.len() as i32;
    let mut emitted = 0u32;
    let mut stop_reason = StopReason::MaxTokens;

    // Bytes of a multi-byte character split across tokens
    let mut utf8_buffer: Vec<u8> = Vec::new();

    for _ in 0..params.max_tokens {
        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            tracing::debug!("End of generation token encountered");
            stop_reason = StopReason::EndOfGeneration;
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("Failed to convert token to bytes: {e}")))?;
        utf8_buffer.extend_from_slice(&token_bytes);

        let valid_len = match std::str::from_utf8(&utf8_buffer) {
            Ok(_) => utf8_buffer.len(),
            // Invalid bytes (not just an incomplete tail) are flushed lossily
            Err(e) if e.error_len().is_some() => utf8_buffer.len(),
            Err(e) => e.valid_up_to(),
        };
        if valid_len > 0 {
            let text = String::from_utf8_lossy(&utf8_buffer[..valid_len]).into_owned();
            utf8_buffer.drain(..valid_len);
            if on_token(&text).is_break() {
                tracing::debug!("Generation stopped by sink");
                return Ok(Completion {
                    tokens: emitted,
                    stop_reason: StopReason::Stopped,
                });
            }
            emitted += 1;
        }

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;

        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;

        n_decoded += 1;
    }

    if !utf8_buffer.is_empty() {
        let text = String::from_utf8_lossy(&utf8_buffer).into_owned();
        if let ControlFlow::Continue(()) = on_token(&text) {
            emitted += 1;
        }
    }

    Ok(Completion {
        tokens: emitted,
        stop_reason,
    })
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

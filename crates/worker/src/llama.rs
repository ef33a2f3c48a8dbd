//! llama.cpp engine adapter
//!
//! Backend, model and context are separate resources with a strict
//! lifetime order: the context borrows the model, and both need the
//! backend. Callers hold them as locals and drop them in reverse order.

use crate::engine::{InferenceBackend, Position, SequenceId, TokenId};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use llmpipe_common::config::ModelConfig;
use llmpipe_common::{LlmPipeError, Result};
use std::num::NonZeroU32;
use std::path::Path;
use tracing::{debug, info};

/// Initialize the global llama.cpp backend
pub fn init_backend() -> Result<LlamaBackend> {
    LlamaBackend::init().map_err(|e| LlmPipeError::model(format!("Failed to initialize backend: {}", e)))
}

/// Load a GGUF model. Weights are memory-mapped by llama.cpp.
pub fn load_model(backend: &LlamaBackend, path: &Path, config: &ModelConfig) -> Result<LlamaModel> {
    if !path.exists() {
        return Err(LlmPipeError::model(format!("Model file not found: {}", path.display())));
    }

    info!("Loading model from {}", path.display());
    let params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);

    let model = LlamaModel::load_from_file(backend, path, &params)
        .map_err(|e| LlmPipeError::model(format!("Failed to load model {}: {}", path.display(), e)))?;

    info!(
        "Model loaded: {} parameters, {} MB",
        model.n_params(),
        model.size() / (1024 * 1024)
    );
    Ok(model)
}

/// [`InferenceBackend`] over a llama.cpp context
pub struct LlamaEngine<'m> {
    model: &'m LlamaModel,
    context: LlamaContext<'m>,
    vocab_size: usize,
    eos_token: TokenId,

    /// Batch index of the token whose logits were requested last
    logits_index: i32,
}

impl<'m> LlamaEngine<'m> {
    /// Create an inference context for `model`
    pub fn new(backend: &LlamaBackend, model: &'m LlamaModel, config: &ModelConfig) -> Result<Self> {
        let threads = i32::try_from(config.effective_threads())
            .map_err(|_| LlmPipeError::config("thread count out of range"))?;

        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.context_size))
            .with_n_batch(config.context_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let context = model
            .new_context(backend, params)
            .map_err(|e| LlmPipeError::context(format!("Failed to create context: {}", e)))?;

        let vocab_size = usize::try_from(model.n_vocab())
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| LlmPipeError::vocabulary(format!("Invalid vocabulary size {}", model.n_vocab())))?;
        let eos_token = model.token_eos().0;

        info!(
            "Context created: n_ctx={}, threads={}, vocab_size={}",
            config.context_size, threads, vocab_size
        );

        Ok(Self {
            model,
            context,
            vocab_size,
            eos_token,
            logits_index: 0,
        })
    }
}

impl InferenceBackend for LlamaEngine<'_> {
    type Batch = LlamaBatch;

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn eos_token(&self) -> TokenId {
        self.eos_token
    }

    fn tokenize(&self, text: &str, add_bos: bool, capacity: usize) -> Result<Vec<TokenId>> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| LlmPipeError::tokenization(e.to_string()))?;

        if tokens.len() > capacity {
            return Err(LlmPipeError::capacity(tokens.len(), capacity));
        }

        Ok(tokens.into_iter().map(|token| token.0).collect())
    }

    fn new_batch(&mut self, capacity: usize) -> Self::Batch {
        LlamaBatch::new(capacity, 1)
    }

    fn add_to_batch(
        &self,
        batch: &mut Self::Batch,
        token: TokenId,
        position: Position,
        sequence: SequenceId,
        want_scores: bool,
    ) -> Result<()> {
        batch
            .add(LlamaToken::new(token), position, &[sequence], want_scores)
            .map_err(|e| LlmPipeError::decode(format!("Failed to add token to batch: {}", e)))
    }

    fn evaluate(&mut self, batch: &mut Self::Batch) -> Result<()> {
        self.context
            .decode(batch)
            .map_err(|e| LlmPipeError::decode(e.to_string()))?;

        // Only the final entry of every batch the session builds asks for logits.
        self.logits_index = batch.n_tokens() - 1;
        Ok(())
    }

    fn release_batch(&mut self, batch: Self::Batch) {
        debug!("Freeing batch of {} tokens", batch.n_tokens());
        drop(batch);
    }

    fn scores(&self) -> &[f32] {
        self.context.get_logits_ith(self.logits_index)
    }

    fn token_to_piece(&self, token: TokenId, capacity: usize) -> Result<Vec<u8>> {
        let piece = self
            .model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| LlmPipeError::tokenization(e.to_string()))?;

        if piece.len() > capacity {
            return Err(LlmPipeError::capacity(piece.len(), capacity));
        }
        Ok(piece)
    }
}

//! Generation session: prefill and greedy decode
//!
//! Turns one prompt into one generated string. Each request runs on a fresh
//! sequence: prompt tokens take positions `0..n`, and every generated token
//! takes the next unused position.

use crate::batching::ScopedBatch;
use crate::engine::{InferenceBackend, Position, SequenceId, TokenId, DEFAULT_SEQUENCE};
use crate::sampling::greedy_argmax;
use llmpipe_common::config::GenerationConfig;
use llmpipe_common::{LlmPipeError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Why the decode loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced its end-of-sequence token
    EndOfSequence,

    /// The step budget ran out
    MaxTokens,

    /// An evaluation failed after generation had started
    DecodeFailed,
}

/// Result of one request
#[derive(Debug, Clone)]
pub struct Generation {
    /// Generated text, without the end-of-sequence token
    pub text: String,

    /// Tokens in the prompt, including the begin-of-sequence marker
    pub prompt_tokens: usize,

    /// Tokens selected by the decode loop, excluding end-of-sequence
    pub completion_tokens: usize,

    /// Why generation stopped
    pub stop_reason: StopReason,

    /// Time spent evaluating the prompt
    pub prompt_duration: Duration,

    /// Time spent in the decode loop
    pub generation_duration: Duration,
}

/// Per-request sequence bookkeeping
#[derive(Debug)]
struct SequenceState {
    next_position: Position,
    id: SequenceId,
}

impl SequenceState {
    fn new() -> Self {
        Self {
            next_position: 0,
            id: DEFAULT_SEQUENCE,
        }
    }

    /// Claim the next position
    fn advance(&mut self) -> Position {
        let position = self.next_position;
        self.next_position += 1;
        position
    }
}

/// Runs prompts through an inference engine
pub struct GenerationSession<E> {
    /// Engine shared by all requests
    engine: E,

    /// Generation limits
    config: GenerationConfig,

    /// Score entries scanned per step
    vocab_size: usize,

    /// End-of-sequence token
    eos_token: TokenId,
}

impl<E: InferenceBackend> GenerationSession<E> {
    /// Create a session. Vocabulary size and end-of-sequence token are read once here.
    pub fn new(engine: E, config: GenerationConfig) -> Self {
        let vocab_size = engine.vocab_size();
        let eos_token = engine.eos_token();
        debug!(
            "Generation session ready: vocab_size={}, eos={}, max_new_tokens={}",
            vocab_size, eos_token, config.max_new_tokens
        );

        Self {
            engine,
            config,
            vocab_size,
            eos_token,
        }
    }

    /// Get a reference to the engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Evaluate the warmup prompt once so the engine settles its buffers
    pub fn warmup(&mut self) -> Result<()> {
        let start = Instant::now();
        let prompt = self.config.warmup_prompt.clone();
        let tokens = self.tokenize(&prompt, self.config.warmup_token_capacity)?;

        let mut sequence = SequenceState::new();
        self.prefill(&mut sequence, &tokens)?;

        debug!("Warmup evaluated {} tokens in {:?}", tokens.len(), start.elapsed());
        Ok(())
    }

    /// Generate from a raw prompt payload
    pub fn generate_bytes(&mut self, prompt: &[u8]) -> Result<Generation> {
        let prompt = std::str::from_utf8(prompt)
            .map_err(|e| LlmPipeError::tokenization(format!("prompt is not valid UTF-8: {}", e)))?;
        self.generate(prompt)
    }

    /// Generate a completion for `prompt`.
    ///
    /// Tokenization and prompt evaluation failures are returned as errors. An
    /// evaluation failure once decoding has started ends generation early and
    /// the text produced so far is returned.
    pub fn generate(&mut self, prompt: &str) -> Result<Generation> {
        let capacity = prompt.len() + self.config.token_margin;
        let tokens = self.tokenize(prompt, capacity)?;

        let mut sequence = SequenceState::new();

        let prefill_start = Instant::now();
        self.prefill(&mut sequence, &tokens)?;
        let prompt_duration = prefill_start.elapsed();
        trace!("Prefilled {} tokens in {:?}", tokens.len(), prompt_duration);

        let decode_start = Instant::now();
        let mut output = Vec::new();
        let mut completion_tokens = 0;
        let mut stop_reason = StopReason::MaxTokens;

        for _ in 0..self.config.max_new_tokens {
            let token = match self.select_next_token() {
                Some(token) => token,
                None => {
                    warn!("Engine returned no usable scores, stopping generation");
                    stop_reason = StopReason::DecodeFailed;
                    break;
                }
            };

            if token == self.eos_token {
                stop_reason = StopReason::EndOfSequence;
                break;
            }

            match self.engine.token_to_piece(token, self.config.piece_capacity) {
                Ok(piece) => output.extend_from_slice(&piece),
                Err(e) => trace!("Skipping text for token {}: {}", token, e),
            }
            completion_tokens += 1;

            if let Err(e) = self.decode_step(&mut sequence, token) {
                warn!(
                    "Evaluation failed after {} tokens, returning partial output: {}",
                    completion_tokens, e
                );
                stop_reason = StopReason::DecodeFailed;
                break;
            }
        }

        let text = match String::from_utf8(output) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };

        Ok(Generation {
            text,
            prompt_tokens: tokens.len(),
            completion_tokens,
            stop_reason,
            prompt_duration,
            generation_duration: decode_start.elapsed(),
        })
    }

    /// Tokenize with the begin-of-sequence marker, within `capacity` tokens
    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>> {
        let tokens = self.engine.tokenize(text, true, capacity)?;

        if tokens.len() > capacity {
            return Err(LlmPipeError::capacity(tokens.len(), capacity));
        }
        if tokens.is_empty() {
            return Err(LlmPipeError::tokenization("prompt produced no tokens"));
        }

        Ok(tokens)
    }

    /// Evaluate all prompt tokens; only the last one requests scores
    fn prefill(&mut self, sequence: &mut SequenceState, tokens: &[TokenId]) -> Result<()> {
        let mut batch = ScopedBatch::new(&mut self.engine, tokens.len());
        let last = tokens.len().saturating_sub(1);

        for (i, &token) in tokens.iter().enumerate() {
            batch.push(token, sequence.advance(), sequence.id, i == last)?;
        }

        batch.evaluate()
    }

    /// Evaluate one generated token at the next position
    fn decode_step(&mut self, sequence: &mut SequenceState, token: TokenId) -> Result<()> {
        let mut batch = ScopedBatch::new(&mut self.engine, 1);
        batch.push(token, sequence.advance(), sequence.id, true)?;
        batch.evaluate()
    }

    /// Greedy pick over the vocabulary-sized prefix of the score array
    fn select_next_token(&self) -> Option<TokenId> {
        let scores = self.engine.scores();
        let scores = &scores[..self.vocab_size.min(scores.len())];

        greedy_argmax(scores).and_then(|index| TokenId::try_from(index).ok())
    }
}

//! Inference engine capability interface
//!
//! The worker never touches tensors, weights or tokenizer tables directly.
//! Everything it needs from the engine goes through [`InferenceBackend`].

use llmpipe_common::Result;

/// Token identifier in the model vocabulary
pub type TokenId = i32;

/// Zero-based position of a token within its sequence
pub type Position = i32;

/// Sequence identifier attached to batch entries
pub type SequenceId = i32;

/// The single sequence every request runs on
pub const DEFAULT_SEQUENCE: SequenceId = 0;

/// Narrow view of an inference engine.
///
/// Batches are engine-owned resources: every batch obtained from
/// [`new_batch`](InferenceBackend::new_batch) must be handed back through
/// [`release_batch`](InferenceBackend::release_batch). Use
/// [`ScopedBatch`](crate::ScopedBatch) rather than calling these directly.
pub trait InferenceBackend {
    /// Engine-owned batch handle
    type Batch;

    /// Number of entries in the score array
    fn vocab_size(&self) -> usize;

    /// End-of-sequence token id
    fn eos_token(&self) -> TokenId;

    /// Tokenize `text`, optionally with the begin-of-sequence marker.
    ///
    /// Fails with a capacity error if the true token count exceeds `capacity`.
    fn tokenize(&self, text: &str, add_bos: bool, capacity: usize) -> Result<Vec<TokenId>>;

    /// Allocate a batch holding up to `capacity` tokens
    fn new_batch(&mut self, capacity: usize) -> Self::Batch;

    /// Append one token to a batch
    fn add_to_batch(
        &self,
        batch: &mut Self::Batch,
        token: TokenId,
        position: Position,
        sequence: SequenceId,
        want_scores: bool,
    ) -> Result<()>;

    /// Evaluate a batch. Blocks until the engine is done.
    fn evaluate(&mut self, batch: &mut Self::Batch) -> Result<()>;

    /// Return a batch to the engine
    fn release_batch(&mut self, batch: Self::Batch);

    /// Scores of the last token that requested them in the most recent
    /// successful [`evaluate`](InferenceBackend::evaluate).
    fn scores(&self) -> &[f32];

    /// Text fragment for `token`, at most `capacity` bytes
    fn token_to_piece(&self, token: TokenId, capacity: usize) -> Result<Vec<u8>>;
}

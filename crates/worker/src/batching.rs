//! Scoped evaluation batches
//!
//! A [`ScopedBatch`] borrows the engine for as long as the batch lives and
//! hands the batch back on drop, so a batch can never outlive the evaluation
//! it was built for, whichever way that evaluation ends.

use crate::engine::{InferenceBackend, Position, SequenceId, TokenId};
use llmpipe_common::{LlmPipeError, Result};
use tracing::trace;

/// Engine batch released back to the engine when dropped
pub struct ScopedBatch<'e, E: InferenceBackend> {
    /// Engine that owns the batch
    engine: &'e mut E,

    /// Batch handle, `None` only once released
    batch: Option<E::Batch>,

    /// Tokens added so far
    len: usize,

    /// Tokens the batch was allocated for
    capacity: usize,
}

impl<'e, E: InferenceBackend> ScopedBatch<'e, E> {
    /// Allocate a batch for up to `capacity` tokens
    pub fn new(engine: &'e mut E, capacity: usize) -> Self {
        let batch = engine.new_batch(capacity);
        trace!("Allocated batch for {} tokens", capacity);

        Self {
            engine,
            batch: Some(batch),
            len: 0,
            capacity,
        }
    }

    /// Add a token at `position` of `sequence`
    pub fn push(
        &mut self,
        token: TokenId,
        position: Position,
        sequence: SequenceId,
        want_scores: bool,
    ) -> Result<()> {
        if self.len >= self.capacity {
            return Err(LlmPipeError::capacity(self.len + 1, self.capacity));
        }

        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| LlmPipeError::internal("batch already released"))?;
        self.engine
            .add_to_batch(batch, token, position, sequence, want_scores)?;

        self.len += 1;
        Ok(())
    }

    /// Number of tokens in the batch
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Evaluate the batch and release it, whether or not evaluation succeeds
    pub fn evaluate(mut self) -> Result<()> {
        if self.is_empty() {
            return Err(LlmPipeError::decode("empty batch"));
        }

        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| LlmPipeError::internal("batch already released"))?;
        self.engine.evaluate(batch)
    }
}

impl<E: InferenceBackend> Drop for ScopedBatch<'_, E> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            self.engine.release_batch(batch);
            trace!("Released batch of {} tokens", self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Engine that only tracks batch bookkeeping
    #[derive(Default)]
    struct CountingEngine {
        created: usize,
        released: usize,
        entries: Vec<(TokenId, Position, SequenceId, bool)>,
        fail_evaluate: bool,
    }

    impl InferenceBackend for CountingEngine {
        type Batch = Vec<(TokenId, Position, SequenceId, bool)>;

        fn vocab_size(&self) -> usize {
            4
        }

        fn eos_token(&self) -> TokenId {
            2
        }

        fn tokenize(&self, _text: &str, _add_bos: bool, _capacity: usize) -> Result<Vec<TokenId>> {
            Ok(vec![1])
        }

        fn new_batch(&mut self, capacity: usize) -> Self::Batch {
            self.created += 1;
            Vec::with_capacity(capacity)
        }

        fn add_to_batch(
            &self,
            batch: &mut Self::Batch,
            token: TokenId,
            position: Position,
            sequence: SequenceId,
            want_scores: bool,
        ) -> Result<()> {
            batch.push((token, position, sequence, want_scores));
            Ok(())
        }

        fn evaluate(&mut self, batch: &mut Self::Batch) -> Result<()> {
            if self.fail_evaluate {
                return Err(LlmPipeError::decode("injected"));
            }
            self.entries.extend(batch.iter().copied());
            Ok(())
        }

        fn release_batch(&mut self, _batch: Self::Batch) {
            self.released += 1;
        }

        fn scores(&self) -> &[f32] {
            &[]
        }

        fn token_to_piece(&self, _token: TokenId, _capacity: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_batch_released_after_evaluation() {
        let mut engine = CountingEngine::default();

        let mut batch = ScopedBatch::new(&mut engine, 2);
        batch.push(1, 0, 0, false).unwrap();
        batch.push(7, 1, 0, true).unwrap();
        batch.evaluate().unwrap();

        assert_eq!(engine.created, 1);
        assert_eq!(engine.released, 1);
        assert_eq!(engine.entries, vec![(1, 0, 0, false), (7, 1, 0, true)]);
    }

    #[test]
    fn test_batch_released_on_failed_evaluation() {
        let mut engine = CountingEngine {
            fail_evaluate: true,
            ..Default::default()
        };

        let mut batch = ScopedBatch::new(&mut engine, 1);
        batch.push(5, 3, 0, true).unwrap();
        assert!(batch.evaluate().is_err());

        assert_eq!(engine.created, 1);
        assert_eq!(engine.released, 1);
    }

    #[test]
    fn test_batch_released_when_never_evaluated() {
        let mut engine = CountingEngine::default();
        {
            let mut batch = ScopedBatch::new(&mut engine, 1);
            batch.push(5, 0, 0, true).unwrap();
        }

        assert_eq!(engine.released, 1);
        assert!(engine.entries.is_empty());
    }

    #[test]
    fn test_batch_capacity_is_enforced() {
        let mut engine = CountingEngine::default();

        let mut batch = ScopedBatch::new(&mut engine, 1);
        batch.push(5, 0, 0, true).unwrap();
        assert!(matches!(
            batch.push(6, 1, 0, true),
            Err(LlmPipeError::Capacity { needed: 2, capacity: 1 })
        ));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_empty_batch_is_not_evaluated() {
        let mut engine = CountingEngine::default();

        let batch = ScopedBatch::new(&mut engine, 4);
        assert!(matches!(batch.evaluate(), Err(LlmPipeError::Decode(_))));
        assert_eq!(engine.released, 1);
    }
}

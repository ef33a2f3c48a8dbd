//! llmpipe Worker
//!
//! Long-lived text-generation worker driven over stdin/stdout. The model is
//! loaded once; each length-prefixed prompt is tokenized, prefilled and
//! decoded greedily, and the generated text is written back as one frame.

pub mod batching;
pub mod engine;
pub mod inference;
pub mod sampling;
pub mod server;
pub mod shutdown;

#[cfg(feature = "llama")]
pub mod llama;

pub use batching::ScopedBatch;
pub use engine::{InferenceBackend, Position, SequenceId, TokenId, DEFAULT_SEQUENCE};
pub use inference::{Generation, GenerationSession, StopReason};
pub use sampling::greedy_argmax;
pub use server::{ShutdownReason, Worker, WorkerState};
pub use shutdown::ShutdownSignal;

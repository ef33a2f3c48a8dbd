//! llmpipe common library
//!
//! Shared error, configuration and metrics types used by the worker and the
//! host-side coordinator.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use error::{LlmPipeError, Result};
pub use metrics::{MetricsRegistry, METRICS};

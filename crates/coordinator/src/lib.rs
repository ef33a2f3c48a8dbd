//! llmpipe Coordinator
//!
//! Host side of the worker channel: spawns a worker process and exchanges
//! prompts and responses with it over its stdio pipes.

pub mod worker_client;

pub use worker_client::{SpawnOptions, WorkerClient};

//! Configuration structures for llmpipe
//!
//! The worker runs with built-in defaults. A YAML file and `LLMPIPE__*`
//! environment variables can override individual keys, e.g.
//! `LLMPIPE__GENERATION__MAX_NEW_TOKENS=64`.

use crate::error::{LlmPipeError, Result};
use llmpipe_proto::{DEFAULT_HANDSHAKE, DEFAULT_MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "LLMPIPE_CONFIG";

/// Prefix for per-key environment overrides
pub const ENV_PREFIX: &str = "LLMPIPE";

/// Top-level worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Engine and context parameters
    pub model: ModelConfig,

    /// Generation limits and scratch buffer sizes
    pub generation: GenerationConfig,

    /// Host channel settings
    pub protocol: ProtocolConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Engine and context parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context window in tokens
    pub context_size: u32,

    /// Computation threads (0 = logical CPU count)
    pub threads: usize,

    /// Layers to offload to a GPU
    pub gpu_layers: u32,
}

/// Generation limits and scratch buffer sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum decode steps per request
    pub max_new_tokens: usize,

    /// Extra token slots above the prompt byte length, for special tokens
    pub token_margin: usize,

    /// Byte capacity for a single token's text fragment
    pub piece_capacity: usize,

    /// Prompt evaluated once at startup to settle engine buffers
    pub warmup_prompt: String,

    /// Token capacity for the warmup prompt
    pub warmup_token_capacity: usize,
}

/// Host channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Line printed once the worker accepts requests
    pub handshake: String,

    /// Largest prompt payload accepted
    pub max_frame_bytes: u32,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log the metrics exposition when the worker stops
    pub log_metrics_on_shutdown: bool,
}

/// Default value functions
fn default_context_size() -> u32 {
    4096
}

fn default_max_new_tokens() -> usize {
    256
}

fn default_token_margin() -> usize {
    8
}

fn default_piece_capacity() -> usize {
    256
}

fn default_warmup_prompt() -> String {
    " ".to_string()
}

fn default_warmup_token_capacity() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_size: default_context_size(),
            threads: 0,
            gpu_layers: 0,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            token_margin: default_token_margin(),
            piece_capacity: default_piece_capacity(),
            warmup_prompt: default_warmup_prompt(),
            warmup_token_capacity: default_warmup_token_capacity(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_metrics_on_shutdown: true,
        }
    }
}

impl ModelConfig {
    /// Thread count handed to the engine
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }
}

impl WorkerConfig {
    /// Load configuration from defaults, an optional YAML file and the environment.
    ///
    /// When `path` is `None`, the file named by `LLMPIPE_CONFIG` is used if set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_PATH_ENV).map(std::path::PathBuf::from);
        let path = path.map(Path::to_path_buf).or(from_env);

        Self::build(
            path.as_deref(),
            config::Environment::with_prefix(ENV_PREFIX).separator("__"),
        )
    }

    /// Load configuration from a YAML file, ignoring the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::build(
            Some(path.as_ref()),
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .source(Some(config::Map::new())),
        )
    }

    fn build(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: WorkerConfig = builder
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LlmPipeError::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.context_size == 0 {
            return Err(LlmPipeError::config("model.context_size must be positive"));
        }

        let generation = &self.generation;
        if generation.max_new_tokens == 0 {
            return Err(LlmPipeError::config("generation.max_new_tokens must be positive"));
        }
        if generation.piece_capacity == 0 {
            return Err(LlmPipeError::config("generation.piece_capacity must be positive"));
        }
        if generation.warmup_token_capacity == 0 {
            return Err(LlmPipeError::config(
                "generation.warmup_token_capacity must be positive",
            ));
        }

        let handshake = &self.protocol.handshake;
        if handshake.is_empty() || handshake.contains('\n') {
            return Err(LlmPipeError::config(format!(
                "Invalid handshake line: {:?}",
                handshake
            )));
        }
        if self.protocol.max_frame_bytes == 0 {
            return Err(LlmPipeError::config("protocol.max_frame_bytes must be positive"));
        }

        Ok(())
    }
}

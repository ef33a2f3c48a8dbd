//! llmpipe worker - main entry point
//!
//! Loads a GGUF model, prints the handshake on stdout and answers
//! length-prefixed prompts from stdin until the host closes the pipe or
//! SIGINT/SIGTERM arrives. Logs go to stderr.

use clap::Parser;
use llmpipe_common::{LlmPipeError, Result, WorkerConfig, METRICS};
use llmpipe_worker::llama::{self, LlamaEngine};
use llmpipe_worker::{GenerationSession, ShutdownSignal, Worker};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Blocking stdin reads cannot be cancelled, so the runtime is not waited on forever
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

/// Text generation worker speaking length-prefixed frames over stdio
#[derive(Parser, Debug)]
#[command(name = "llmpipe-worker", version, about)]
struct Cli {
    /// Path to a GGUF model file
    model_path: PathBuf,

    /// YAML configuration file
    #[arg(long, env = "LLMPIPE_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => e.exit(),
    };

    let config = match WorkerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("llmpipe-worker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // stdout carries the protocol, so logs go to stderr only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("llmpipe_worker={}", config.observability.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run(cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Worker failed to start: {}", e);
            ExitCode::FAILURE
        }
    };

    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    code
}

async fn run(cli: Cli, config: WorkerConfig) -> Result<()> {
    info!("Starting llmpipe worker");

    let shutdown = ShutdownSignal::new();
    let signals = shutdown
        .listen_for_signals()
        .map_err(|e| LlmPipeError::internal(format!("Failed to install signal handlers: {}", e)))?;

    let backend = llama::init_backend()?;
    let model = llama::load_model(&backend, &cli.model_path, &config.model)?;
    let engine = LlamaEngine::new(&backend, &model, &config.model)?;

    let session = GenerationSession::new(engine, config.generation.clone());
    let mut worker = Worker::new(session, config.protocol.clone());

    let reason = worker
        .run(
            BufReader::new(tokio::io::stdin()),
            BufWriter::new(tokio::io::stdout()),
            &shutdown,
        )
        .await;
    info!("Shutting down: {:?}", reason);
    signals.abort();

    // Context first, then the model it borrows, then the backend
    drop(worker);
    info!("Context released");
    drop(model);
    info!("Model released");
    drop(backend);
    info!("Backend released");

    if config.observability.log_metrics_on_shutdown {
        info!("Final metrics:\n{}", METRICS.gather());
    }

    info!("llmpipe worker shutdown complete");
    Ok(())
}

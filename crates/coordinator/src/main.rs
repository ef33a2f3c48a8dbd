//! llmpipe Coordinator - Main Entry Point
//!
//! Spawns one worker, sends it each prompt in turn and prints the responses.
//! Prompts come from the command line, or one per line from stdin.

use anyhow::Context;
use clap::Parser;
use llmpipe_common::LlmPipeError;
use llmpipe_coordinator::{SpawnOptions, WorkerClient};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Drive an llmpipe worker from the command line
#[derive(Parser, Debug)]
#[command(name = "llmpipe-coordinator", version, about)]
struct Cli {
    /// Worker executable
    #[arg(long, default_value = "llmpipe-worker")]
    worker: PathBuf,

    /// Path to a GGUF model file
    model_path: PathBuf,

    /// Worker configuration file
    #[arg(long, env = "LLMPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for the worker to load its model
    #[arg(long, default_value_t = 300)]
    ready_timeout: u64,

    /// Prompts to send; read from stdin, one per line, when empty
    prompts: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llmpipe_coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut options = SpawnOptions::new(&cli.worker, &cli.model_path);
    options.config_path = cli.config.clone();
    options.handshake_timeout = Duration::from_secs(cli.ready_timeout);

    let mut client = WorkerClient::spawn(&options)
        .await
        .with_context(|| format!("failed to start worker {}", cli.worker.display()))?;

    if cli.prompts.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(prompt) = lines.next_line().await? {
            ask(&mut client, &prompt).await?;
        }
    } else {
        for prompt in &cli.prompts {
            ask(&mut client, prompt).await?;
        }
    }

    if let Some(status) = client.close().await? {
        info!("Worker finished with {}", status);
    }
    Ok(())
}

/// Print one response. Request-level failures are reported and skipped.
async fn ask<R, W>(client: &mut WorkerClient<R, W>, prompt: &str) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    match client.generate(prompt).await {
        Ok(text) => {
            println!("{}", text);
            Ok(())
        }
        Err(LlmPipeError::Worker(reason)) => {
            warn!("Worker rejected prompt: {}", reason);
            Ok(())
        }
        Err(e) => Err(e).context("worker channel failed"),
    }
}

//! Worker client for driving a worker process over its stdio pipes

use llmpipe_common::error::{LlmPipeError, Result};
use llmpipe_proto::{FrameReader, FrameWriter, Response, DEFAULT_HANDSHAKE};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// How to start a worker process
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Worker executable
    pub worker_bin: PathBuf,

    /// Model file handed to the worker
    pub model_path: PathBuf,

    /// Optional worker configuration file
    pub config_path: Option<PathBuf>,

    /// Handshake line the worker prints when ready
    pub handshake: String,

    /// How long model loading may take
    pub handshake_timeout: Duration,

    /// How long to wait for exit after closing the worker's stdin
    pub shutdown_timeout: Duration,
}

impl SpawnOptions {
    /// Options with default handshake and timeouts
    pub fn new(worker_bin: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            model_path: model_path.into(),
            config_path: None,
            handshake: DEFAULT_HANDSHAKE.to_string(),
            handshake_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Worker client wrapper
///
/// Requests are strictly sequential: one prompt out, one response back.
pub struct WorkerClient<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    child: Option<Child>,
    shutdown_timeout: Duration,
}

impl WorkerClient<BufReader<ChildStdout>, ChildStdin> {
    /// Spawn a worker and wait for its handshake
    pub async fn spawn(options: &SpawnOptions) -> Result<Self> {
        let mut command = Command::new(&options.worker_bin);
        command.arg(&options.model_path);
        if let Some(config_path) = &options.config_path {
            command.arg("--config").arg(config_path);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            "Spawned worker {} (pid {:?})",
            options.worker_bin.display(),
            child.id()
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LlmPipeError::internal("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmPipeError::internal("worker stdout not captured"))?;

        let mut client = Self::from_io(BufReader::new(stdout), stdin);
        client.child = Some(child);
        client.shutdown_timeout = options.shutdown_timeout;

        client
            .wait_ready(&options.handshake, options.handshake_timeout)
            .await?;
        Ok(client)
    }
}

impl<R, W> WorkerClient<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Drive a worker over arbitrary streams. No process is attached.
    pub fn from_io(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            child: None,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Wait for the worker's handshake line
    pub async fn wait_ready(&mut self, handshake: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.reader.read_handshake(handshake))
            .await
            .map_err(|_| LlmPipeError::timeout(format!("no handshake within {:?}", timeout)))??;

        debug!("Worker ready");
        Ok(())
    }

    /// Send one prompt and wait for its response.
    ///
    /// An `ERROR: ` response becomes [`LlmPipeError::Worker`]; the channel
    /// stays usable afterwards.
    pub async fn generate(&mut self, prompt: &str) -> Result<String> {
        self.writer.write_message(prompt.as_bytes()).await?;

        let payload = self
            .reader
            .read_message()
            .await?
            .ok_or_else(|| {
                LlmPipeError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "worker closed its output",
                ))
            })?;

        match Response::parse(payload) {
            Response::Text(text) => Ok(text),
            Response::Error(reason) => Err(LlmPipeError::worker(reason)),
        }
    }

    /// Close the worker's input and wait for it to exit.
    ///
    /// A worker that outlives the shutdown timeout is killed. Returns `None`
    /// when no process is attached.
    pub async fn close(self) -> Result<Option<ExitStatus>> {
        let WorkerClient {
            reader,
            writer,
            child,
            shutdown_timeout,
        } = self;

        // Dropping stdin is what delivers end-of-stream to the worker
        drop(writer);
        drop(reader);

        let Some(mut child) = child else {
            return Ok(None);
        };

        match tokio::time::timeout(shutdown_timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!("Worker exited: {}", status);
                Ok(Some(status))
            }
            Err(_) => {
                warn!("Worker did not exit within {:?}, killing it", shutdown_timeout);
                child.kill().await?;
                Ok(Some(child.wait().await?))
            }
        }
    }
}

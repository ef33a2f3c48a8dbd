//! Request loop
//!
//! Drives one [`GenerationSession`] over a framed byte channel:
//! warm up, print the handshake, then answer one prompt at a time until the
//! host closes the channel or a stop is requested.

use crate::engine::InferenceBackend;
use crate::inference::{Generation, GenerationSession, StopReason};
use crate::shutdown::ShutdownSignal;
use llmpipe_common::config::ProtocolConfig;
use llmpipe_common::error::REASON_INTERNAL;
use llmpipe_common::metrics::LatencyTimer;
use llmpipe_common::METRICS;
use llmpipe_proto::{FrameReader, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Request loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    WarmingUp,
    Ready,
    ReadingRequest,
    Generating,
    WritingResponse,
    ShuttingDown,
}

/// Why the request loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Host closed its side, possibly mid-frame
    EndOfStream,

    /// SIGINT/SIGTERM observed between requests
    StopRequested,

    /// Channel failed: write error, oversized frame or read error
    ChannelClosed,
}

/// Outcome of a single request
enum RequestOutcome {
    Answered,
    ChannelClosed,
}

/// Serves prompts from a framed channel
pub struct Worker<E> {
    session: GenerationSession<E>,
    protocol: ProtocolConfig,
    state: WorkerState,
}

impl<E: InferenceBackend> Worker<E> {
    /// Create a new worker
    pub fn new(session: GenerationSession<E>, protocol: ProtocolConfig) -> Self {
        Self {
            session,
            protocol,
            state: WorkerState::WarmingUp,
        }
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Get a reference to the generation session
    pub fn session(&self) -> &GenerationSession<E> {
        &self.session
    }

    /// Run until end-of-stream, a stop request or a channel failure.
    ///
    /// Channel failures end the loop rather than surfacing as errors; the
    /// peer may no longer be there to hear about them.
    pub async fn run<R, W>(&mut self, reader: R, writer: W, shutdown: &ShutdownSignal) -> ShutdownReason
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = FrameReader::new(reader).with_max_frame_bytes(self.protocol.max_frame_bytes);
        let mut writer = FrameWriter::new(writer);

        let reason = self.serve(&mut reader, &mut writer, shutdown).await;

        self.transition(WorkerState::ShuttingDown);
        info!("Request loop finished: {:?}", reason);
        reason
    }

    async fn serve<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        shutdown: &ShutdownSignal,
    ) -> ShutdownReason
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.transition(WorkerState::WarmingUp);
        if let Err(e) = self.session.warmup() {
            warn!("Warmup failed, continuing: {}", e);
        }

        self.transition(WorkerState::Ready);
        if let Err(e) = writer.write_handshake(&self.protocol.handshake).await {
            error!("Failed to write handshake: {}", e);
            return ShutdownReason::ChannelClosed;
        }
        info!("Worker ready");

        loop {
            if shutdown.is_triggered() {
                return ShutdownReason::StopRequested;
            }

            self.transition(WorkerState::ReadingRequest);
            let message = tokio::select! {
                biased;
                _ = shutdown.wait() => return ShutdownReason::StopRequested,
                message = reader.read_message() => message,
            };

            let prompt = match message {
                Ok(Some(prompt)) => prompt,
                Ok(None) => {
                    debug!("Input stream closed");
                    return ShutdownReason::EndOfStream;
                }
                Err(e) => {
                    warn!("Failed to read request: {}", e);
                    return ShutdownReason::ChannelClosed;
                }
            };

            let span = info_span!("request", id = %Uuid::new_v4(), prompt_bytes = prompt.len());
            match self.handle_request(&prompt, writer).instrument(span).await {
                RequestOutcome::Answered => {}
                RequestOutcome::ChannelClosed => return ShutdownReason::ChannelClosed,
            }
        }
    }

    async fn handle_request<W>(&mut self, prompt: &[u8], writer: &mut FrameWriter<W>) -> RequestOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let metrics = &METRICS.inference;
        metrics.requests_total.inc();

        self.transition(WorkerState::Generating);
        let session = &mut self.session;
        let result = metrics.request_duration.time(|| session.generate_bytes(prompt));

        self.transition(WorkerState::WritingResponse);
        let written = match result {
            Ok(generation) => {
                record_generation(&generation);
                writer.write_message(generation.text.as_bytes()).await
            }
            Err(e) => match e.protocol_reason() {
                Some(reason) => {
                    warn!("Request failed: {}", e);
                    metrics.requests_failed.inc();
                    writer.write_error(reason).await
                }
                None => {
                    error!("Unexpected request error: {}", e);
                    metrics.requests_failed.inc();
                    writer.write_error(REASON_INTERNAL).await
                }
            },
        };

        match written {
            Ok(()) => RequestOutcome::Answered,
            Err(e) => {
                warn!("Failed to write response: {}", e);
                RequestOutcome::ChannelClosed
            }
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            debug!("Worker state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

fn record_generation(generation: &Generation) {
    let metrics = &METRICS.inference;
    metrics.requests_success.inc();
    metrics.prompt_tokens_total.inc_by(generation.prompt_tokens as u64);
    metrics.tokens_generated_total.inc_by(generation.completion_tokens as u64);
    metrics.prompt_duration.observe(generation.prompt_duration.as_secs_f64());

    let decode_secs = generation.generation_duration.as_secs_f64();
    metrics.generation_duration.observe(decode_secs);
    if generation.completion_tokens > 0 && decode_secs > 0.0 {
        metrics
            .tokens_per_second
            .observe(generation.completion_tokens as f64 / decode_secs);
    }
    if generation.stop_reason == StopReason::DecodeFailed {
        metrics.generations_truncated.inc();
    }

    info!(
        "Generated {} tokens from {} prompt tokens ({:?}) in {:?}",
        generation.completion_tokens,
        generation.prompt_tokens,
        generation.stop_reason,
        generation.prompt_duration + generation.generation_duration
    );
}

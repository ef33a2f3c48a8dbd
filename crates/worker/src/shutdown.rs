//! Stop flag set by SIGINT/SIGTERM
//!
//! The request loop checks the flag between requests and while parked on the
//! next frame. It is never consulted inside a generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

/// One-shot, cloneable shutdown signal
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake the request loop
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
        // notify_one keeps a permit if nobody is waiting yet
        self.inner.notify.notify_one();
    }

    /// Check whether shutdown was requested
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Wait until shutdown is requested
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        self.inner.notify.notified().await;
    }

    /// Trigger this signal on SIGINT or SIGTERM.
    ///
    /// Handlers are registered before this returns; delivery happens on a
    /// spawned task.
    #[cfg(unix)]
    pub fn listen_for_signals(&self) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let shutdown = self.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("Received SIGINT"),
                _ = terminate.recv() => info!("Received SIGTERM"),
            }
            shutdown.trigger();
        }))
    }

    /// Trigger this signal on Ctrl-C
    #[cfg(not(unix))]
    pub fn listen_for_signals(&self) -> std::io::Result<JoinHandle<()>> {
        let shutdown = self.clone();

        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
                shutdown.trigger();
            }
        }))
    }
}

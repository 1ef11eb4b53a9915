use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{signal, sync::broadcast};

/// Default time in-flight requests get to finish once shutdown starts.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Why the gateway is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT: stop admitting and drain.
    Graceful,
    /// Drain abandoned.
    Force,
}

/// Coordinates process shutdown: stop admitting, drain, then exit.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
    /// How long in-flight requests may keep running after shutdown starts
    grace_period: Duration,
}

impl GracefulShutdown {
    /// Manager using [`DEFAULT_GRACE_PERIOD`].
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Shared flag the request handler reads to refuse new work while draining.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_initiated.clone()
    }

    /// Trigger shutdown programmatically. Only the first call has an effect.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "Shutdown triggered");
            let _ = self.shutdown_tx.send(reason);
        } else {
            tracing::debug!(?reason, "Shutdown already initiated, ignoring");
        }
    }

    /// Listen for SIGINT and SIGTERM and trigger a graceful shutdown on the first one.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started, listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for SIGINT");
                    return;
                }
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.trigger_shutdown(ShutdownReason::Graceful);
    }

    /// Resolves when shutdown starts. Raced against the accept loop in `serve`.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.shutdown_token().wait_for_shutdown().await
    }

    /// Handle for background sweepers that must stop with the process.
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

/// Receiver side of [`GracefulShutdown`], cloneable across tasks.
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Pending reason, without waiting.
    pub fn try_shutdown(&mut self) -> Option<ShutdownReason> {
        match self.receiver.try_recv() {
            Ok(reason) => Some(reason),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Closed | broadcast::error::TryRecvError::Lagged(_)) => {
                Some(ShutdownReason::Force)
            }
        }
    }

    /// Resolve once shutdown starts, including when it started before this call.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        if self.is_shutdown_initiated() {
            return self.try_shutdown().unwrap_or(ShutdownReason::Graceful);
        }
        match self.receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => ShutdownReason::Force,
        }
    }
}

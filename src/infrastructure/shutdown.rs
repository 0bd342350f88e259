//! Stopping the relay
//!
//! The route and push job loops watch this controller. A push cycle that
//! already extracted its batches runs to the end so every sent batch gets
//! its acknowledgement recorded; shutdown only keeps the next cycle from
//! starting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Tells job loops to stop and counts the push cycles still running.
#[derive(Clone)]
pub struct ShutdownController {
    shutdown_initiated: Arc<AtomicBool>,
    /// Route and push cycles in flight
    active_jobs: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_jobs: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drain_complete: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop scheduling new cycles. Calling it again does nothing.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("stopping route and push jobs");
            let _ = self.shutdown_tx.send(());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Wait until in-flight cycles have recorded their acks, up to `timeout`.
    /// Returns `false` when batches may be left SENDING.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        if self.active_jobs() == 0 {
            return true;
        }

        tokio::select! {
            _ = self.drain_complete.notified() => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!("drain timeout: {} job cycle(s) still running", self.active_jobs());
                false
            }
        }
    }

    /// Held by a job for the length of one cycle.
    pub fn job_guard(&self) -> JobGuard {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        JobGuard {
            controller: self.clone(),
        }
    }

    fn job_finished(&self) {
        let prev = self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// One running route or push cycle.
pub struct JobGuard {
    controller: ShutdownController,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.controller.job_finished();
    }
}

/// Resolves on Ctrl+C or SIGTERM after telling `controller` to stop.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }

    controller.shutdown();
}

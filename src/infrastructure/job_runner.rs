//! Periodic Job Runner
//!
//! Runs a job on a fixed interval until shutdown. A cycle that is running
//! when shutdown starts is allowed to finish.

use crate::infrastructure::shutdown::ShutdownController;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub name: String,
    pub interval: Duration,
    /// Delay before the first cycle
    pub initial_delay: Duration,
}

impl JobConfig {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            initial_delay: Duration::ZERO,
        }
    }
}

pub struct JobRunner {
    config: JobConfig,
    shutdown: ShutdownController,
    cycles: Arc<AtomicU64>,
}

impl JobRunner {
    pub fn new(config: JobConfig, shutdown: ShutdownController) -> Self {
        Self {
            config,
            shutdown,
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Completed cycles so far.
    pub fn cycles(&self) -> Arc<AtomicU64> {
        self.cycles.clone()
    }

    /// Spawn the loop. `job` is called once per tick.
    pub fn start<F, Fut>(self, job: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let JobRunner {
            config,
            shutdown,
            cycles,
        } = self;
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            if shutdown.is_shutdown() {
                return;
            }
            if !config.initial_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(config.initial_delay) => {}
                    _ = shutdown_rx.recv() => return,
                }
            }

            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("{} job started, every {:?}", config.name, config.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }
                if shutdown.is_shutdown() {
                    break;
                }

                let _guard = shutdown.job_guard();
                job().await;
                cycles.fetch_add(1, Ordering::SeqCst);
            }
            tracing::info!("{} job stopped", config.name);
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let shutdown = ShutdownController::new();
        let runner = JobRunner::new(JobConfig::new("test", Duration::from_millis(10)), shutdown.clone());
        let cycles = runner.cycles();
        let handle = runner.start(|| async {});

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let done = cycles.load(Ordering::SeqCst);
        assert!(done >= 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cycles.load(Ordering::SeqCst), done);
    }

    #[tokio::test]
    async fn test_running_cycle_finishes_before_drain() {
        let shutdown = ShutdownController::new();
        let mut config = JobConfig::new("slow", Duration::from_secs(60));
        config.initial_delay = Duration::ZERO;
        let runner = JobRunner::new(config, shutdown.clone());
        let cycles = runner.cycles();
        let handle = runner.start(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(shutdown.active_jobs(), 1);
        shutdown.shutdown();
        assert!(shutdown.wait_for_drain(Duration::from_secs(1)).await);
        handle.await.unwrap();
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_started_after_shutdown() {
        let shutdown = ShutdownController::new();
        shutdown.shutdown();
        let runner = JobRunner::new(JobConfig::new("late", Duration::from_millis(1)), shutdown);
        let cycles = runner.cycles();
        runner.start(|| async {}).await.unwrap();
        assert_eq!(cycles.load(Ordering::SeqCst), 0);
    }
}

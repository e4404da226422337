//! Polling worker — the long-running delivery loop.
//!
//! Every `interval` the worker builds a fresh [`Dispatcher`] from its
//! factory (nothing scoped survives between cycles), optionally re-arms
//! retryable failures, and drains the pending queue. A stop signal is
//! checked before each cycle and interrupts the wait between cycles; a
//! cycle that has started always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use pigeon_core::error::{PigeonError, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::{Dispatcher, QueueRunStats};

/// Builds the per-cycle dispatcher.
pub type DispatcherFactory = Arc<dyn Fn() -> Result<Dispatcher> + Send + Sync>;

pub struct PollingWorker {
    factory: DispatcherFactory,
    interval: Duration,
    requeue_failed: bool,
}

impl PollingWorker {
    pub fn new<F>(factory: F, interval: Duration) -> Self
    where
        F: Fn() -> Result<Dispatcher> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            interval,
            requeue_failed: true,
        }
    }

    /// Whether each cycle re-arms retryable failures first (default on).
    pub fn with_requeue(mut self, enabled: bool) -> Self {
        self.requeue_failed = enabled;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one delivery cycle.
    pub async fn run_cycle(&self) -> Result<QueueRunStats> {
        tracing::debug!("🔄 Delivery cycle starting");
        let dispatcher = (self.factory)()?;

        if self.requeue_failed {
            if let Err(e) = dispatcher.requeue_retryable().await {
                tracing::warn!("⚠️ Requeue pass failed: {e}");
            }
        }

        let stats = dispatcher.process_pending_queue().await?;
        tracing::debug!("Delivery cycle done: {stats}");
        Ok(stats)
    }

    /// Loop until `stop` flips to `true` or its sender is dropped.
    pub async fn run_until_stopped(&self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Polling worker started (every {}s)",
            self.interval.as_secs_f64()
        );

        loop {
            let stopped = *stop.borrow();
            if stopped {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                tracing::error!("❌ Delivery cycle failed: {e}");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("🛑 Polling worker stopped");
    }

    /// Run on a background tokio task. Dropping the handle also stops it.
    pub fn spawn(self) -> WorkerHandle {
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run_until_stopped(rx).await });
        WorkerHandle { stop, task }
    }
}

pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop after its current cycle.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker task to end.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| PigeonError::Other(format!("Worker task: {e}")))
    }

    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join().await
    }
}

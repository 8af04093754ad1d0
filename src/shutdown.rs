//! Background task ownership and shutdown signalling.
//!
//! Every long-running loop in the gateway (auto discovery, health monitoring,
//! metrics flushing) is spawned through [`BackgroundTask::spawn`]. The returned
//! handle owns the task: [`BackgroundTask::stop`] asks the loop to finish its
//! current iteration and waits for it, and dropping the handle aborts it.
//!
//! # Example
//!
//! ```rust,no_run
//! use graphql_federation_gateway::shutdown::BackgroundTask;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let task = BackgroundTask::spawn("heartbeat", Duration::from_secs(1), || async {
//!     tracing::debug!("tick");
//! });
//!
//! // ... later
//! task.stop().await;
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to a periodic background loop.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period` until stopped.
    ///
    /// The first tick runs after one full period. A tick that is still running
    /// when a stop is requested is allowed to finish.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "Background task exited");
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "Background task started");
        Self {
            name,
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Run `task` until it returns or a stop is requested.
    ///
    /// For event driven loops. On stop, `task` is dropped at its current
    /// await point.
    pub fn spawn_until_stopped<Fut>(name: &'static str, task: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {}
                _ = stop_rx.wait_for(|stop| *stop) => {}
            }
            debug!(task = name, "Background task exited");
        });

        debug!(task = name, "Background task started");
        Self {
            name,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the underlying task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!(task = self.name, "Background task stopped");
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Create a future that completes on SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
pub async fn signal_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            tracing::warn!("Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT (Ctrl+C)");
        }
    }
}

/// Create a future that completes on Ctrl+C.
#[cfg(not(unix))]
pub async fn signal_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}

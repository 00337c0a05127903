//! Background idle-sweep task owned by a limiter.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::LimiterError;

/// A periodic cleanup task with exactly one shutdown signal.
///
/// Signalling is idempotent, so `stop` may race with `Drop` or be called
/// repeatedly.
pub(crate) struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Spawn `sweep` every `interval` on the current tokio runtime.
    pub(crate) fn spawn<F>(name: &'static str, interval: Duration, sweep: F) -> Result<Self, LimiterError>
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        let handle = Handle::try_current().map_err(|_| LimiterError::NoRuntime)?;
        let (shutdown, mut rx) = watch::channel(false);

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = sweep();
                        if evicted > 0 {
                            debug!(limiter = name, evicted, "Swept idle limiter state");
                        } else {
                            trace!(limiter = name, "Sweep found no idle state");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            debug!(limiter = name, "Sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Trigger the shutdown signal without waiting.
    pub(crate) fn signal(&self) {
        self.shutdown.send_replace(true);
    }

    /// Signal shutdown and join the task.
    pub(crate) async fn stop(&self) {
        self.signal();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.lock().as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.signal();
    }
}

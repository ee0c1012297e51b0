//! Cancellable periodic tasks
//!
//! The facade owns a handful of background loops (cache sweep, connection
//! health, trend checks). Each runs as a `PeriodicTask`: a spawned loop
//! that ticks on an interval and exits when the shared shutdown channel
//! fires. `stop()` awaits the task so shutdown is deterministic.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

/// A named background loop tied to the facade's shutdown channel
pub(crate) struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn a loop that runs `tick` every `period` until shutdown fires
    pub(crate) fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            // the first tick completes immediately; wait a full period instead
            timer.tick().await;
            loop {
                tokio::select! {
                    result = shutdown.recv() => {
                        match result {
                            Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                                debug!(task = name, "periodic task received shutdown signal");
                                break;
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                debug!(task = name, missed, "periodic task receiver lagged");
                            }
                        }
                    }
                    _ = timer.tick() => {
                        tick().await;
                    }
                }
            }
            debug!(task = name, "periodic task stopped");
        });
        Self { name, handle }
    }

    /// Await the loop's completion; call after signalling shutdown
    pub(crate) async fn stop(self) {
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "periodic task join failed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

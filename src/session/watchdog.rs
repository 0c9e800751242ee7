//! Stall watchdog: force a sync when a live connection stops syncing.

use super::continuity::SyncClock;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Periodically checks the sync clock while the connection is live
#[derive(Debug, Clone)]
pub struct StallWatchdog {
    clock: SyncClock,
    threshold: Duration,
    interval: Duration,
}

impl StallWatchdog {
    /// Create a watchdog over `clock`
    #[must_use]
    pub fn new(clock: SyncClock, threshold: Duration, interval: Duration) -> Self {
        Self {
            clock,
            threshold,
            interval,
        }
    }

    /// Whether a sync is overdue
    #[must_use]
    pub fn is_stalled(&self, connected: bool) -> bool {
        if !connected {
            return false;
        }
        let elapsed = self.clock.since_last_sync(Utc::now());
        elapsed.to_std().is_ok_and(|elapsed| elapsed > self.threshold)
    }

    /// Check every interval until `cancel` fires, calling `force_sync` when stalled.
    pub async fn run<C, F, Fut, E>(self, is_connected: C, force_sync: F, cancel: CancellationToken)
    where
        C: Fn() -> bool,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.is_stalled(is_connected()) {
                warn!(threshold_secs = self.threshold.as_secs(), "⚠️ Forcing credential sync due to timeout");
                if let Err(e) = force_sync().await {
                    error!(error = %e, "❌ Forced sync failed");
                }
            }
        }
    }
}

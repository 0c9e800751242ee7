//! Health probe report.

use crate::session::{SessionId, SyncClock};
use crate::storage::DocumentStore;
use crate::supervisor::ConnectionState;
use serde::Serialize;
use tracing::debug;

/// Snapshot returned by the health probe.
///
/// Healthy iff the connection is open and the store is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `healthy` or `unhealthy`
    pub status: &'static str,
    /// Connection open
    pub connected: bool,
    /// Durable store reachable
    pub store_connected: bool,
    /// Last successful credential sync (RFC 3339)
    pub last_sync: Option<String>,
    /// Supervised session
    pub session_id: Option<String>,
}

impl HealthReport {
    /// Probe the store and assemble a report
    pub async fn collect(
        state: ConnectionState,
        store: &dyn DocumentStore,
        clock: &SyncClock,
        session_id: Option<&SessionId>,
    ) -> Self {
        let store_connected = match store.check_connection().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Store health check failed");
                false
            }
        };
        let connected = state == ConnectionState::Active;
        Self {
            status: if connected && store_connected {
                "healthy"
            } else {
                "unhealthy"
            },
            connected,
            store_connected,
            last_sync: clock.last_sync().map(|t| t.to_rfc3339()),
            session_id: session_id.map(ToString::to_string),
        }
    }

    /// Whether the probe passed
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

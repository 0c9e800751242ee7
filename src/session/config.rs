//! Configuration for session continuity and supervision.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Session timing and durability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Quiet period before a burst of credential changes is synced
    #[serde(rename = "session_sync_debounce_ms")]
    pub sync_debounce_ms: u64,
    /// A live connection without a sync for this long gets a forced sync
    #[serde(rename = "session_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// How often the stall watchdog looks
    #[serde(rename = "session_stall_check_interval_secs")]
    pub stall_check_interval_secs: u64,
    /// Inactive sessions older than this many days are removed
    #[serde(rename = "session_cleanup_max_age_days")]
    pub cleanup_max_age_days: i64,
    /// How often age-based cleanup runs
    #[serde(rename = "session_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// First reconnect delay
    #[serde(rename = "session_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    /// Reconnect delay ceiling
    #[serde(rename = "session_reconnect_backoff_max_secs")]
    pub reconnect_backoff_max_secs: u64,
    /// Comma separated credential files that must load for a session to resume
    #[serde(rename = "session_critical_files")]
    pub critical_files: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync_debounce_ms: 2_000,
            stall_threshold_secs: 5 * 60,
            stall_check_interval_secs: 60,
            cleanup_max_age_days: 7,
            cleanup_interval_secs: 24 * 60 * 60,
            reconnect_backoff_secs: 5,
            reconnect_backoff_max_secs: 60,
            critical_files: "creds.json".to_string(),
        }
    }
}

impl SessionConfig {
    /// Load session settings from config files and environment variables.
    ///
    /// Priority: env vars → config files → defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());
        let d = Self::default();

        let config = Config::builder()
            .set_default("session_sync_debounce_ms", d.sync_debounce_ms)
            .and_then(|b| b.set_default("session_stall_threshold_secs", d.stall_threshold_secs))
            .and_then(|b| {
                b.set_default("session_stall_check_interval_secs", d.stall_check_interval_secs)
            })
            .and_then(|b| b.set_default("session_cleanup_max_age_days", d.cleanup_max_age_days))
            .and_then(|b| b.set_default("session_cleanup_interval_secs", d.cleanup_interval_secs))
            .and_then(|b| b.set_default("session_reconnect_backoff_secs", d.reconnect_backoff_secs))
            .and_then(|b| {
                b.set_default("session_reconnect_backoff_max_secs", d.reconnect_backoff_max_secs)
            })
            .and_then(|b| b.set_default("session_critical_files", d.critical_files.clone()))
            .and_then(|b| {
                b.add_source(File::with_name("config/default").required(false))
                    .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
                    .add_source(File::with_name("config/local").required(false))
                    .add_source(Environment::default().ignore_empty(true))
                    .build()
            });

        match config.and_then(Config::try_deserialize) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %err, "Failed to load session config, using defaults");
                d
            }
        }
    }

    /// Credential files that must load and verify before anything else
    #[must_use]
    pub fn critical_files(&self) -> Vec<String> {
        self.critical_files
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Debounce window
    #[must_use]
    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    /// Stall threshold
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    /// Stall check period
    #[must_use]
    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs.max(1))
    }

    /// Cleanup period
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

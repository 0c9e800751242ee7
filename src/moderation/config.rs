//! Configuration for the moderation engine.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Moderation configuration loaded from env/files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Messages longer than this many characters are spam
    #[serde(rename = "moderation_max_chars")]
    pub max_chars: usize,
    /// Length of a temporary mute
    #[serde(rename = "moderation_mute_duration_secs")]
    pub mute_duration_secs: u64,
    /// Link warnings that promote a sender to a permanent ban
    #[serde(rename = "moderation_link_ban_threshold")]
    pub link_ban_threshold: u32,

    /// Timing-pattern bot detection toggle
    #[serde(rename = "moderation_bot_detection_enabled")]
    pub bot_detection_enabled: bool,
    /// Messages inspected by the rapid-message rule
    #[serde(rename = "moderation_rapid_message_count")]
    pub rapid_message_count: usize,
    /// Span under which `rapid_message_count` messages flag a bot
    #[serde(rename = "moderation_rapid_message_span_ms")]
    pub rapid_message_span_ms: i64,
    /// Timestamps retained per sender
    #[serde(rename = "moderation_message_window")]
    pub message_window: usize,
    /// Edits of one message that flag a bot
    #[serde(rename = "moderation_rapid_edit_count")]
    pub rapid_edit_count: usize,
    /// Span under which `rapid_edit_count` edits flag a bot
    #[serde(rename = "moderation_rapid_edit_span_ms")]
    pub rapid_edit_span_ms: i64,
    /// Edit trails idle longer than this are dropped
    #[serde(rename = "moderation_edit_idle_secs")]
    pub edit_idle_secs: u64,

    /// History page size for the retroactive scan
    #[serde(rename = "moderation_scan_page_size")]
    pub scan_page_size: usize,
    /// Hard cap on pages pulled by one scan
    #[serde(rename = "moderation_scan_max_pages")]
    pub scan_max_pages: usize,
    /// Pause between deletes during a scan
    #[serde(rename = "moderation_scan_delete_pause_ms")]
    pub scan_delete_pause_ms: u64,

    /// Admin roster cache lifetime; 0 queries the transport every time
    #[serde(rename = "moderation_admin_roster_ttl_secs")]
    pub admin_roster_ttl_secs: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            max_chars: 160,
            mute_duration_secs: 10 * 60,
            link_ban_threshold: 3,
            bot_detection_enabled: true,
            rapid_message_count: 5,
            rapid_message_span_ms: 3_000,
            message_window: 10,
            rapid_edit_count: 3,
            rapid_edit_span_ms: 2_000,
            edit_idle_secs: 10 * 60,
            scan_page_size: 50,
            scan_max_pages: 20,
            scan_delete_pause_ms: 500,
            admin_roster_ttl_secs: 30,
        }
    }
}

impl ModerationConfig {
    /// Load moderation settings from config files and environment variables.
    ///
    /// Priority: env vars → config files → defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Self::with_defaults(Config::builder()).and_then(|b| {
            b.add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
                .add_source(File::with_name("config/local").required(false))
                .add_source(Environment::default().ignore_empty(true))
                .build()
        });

        match config.and_then(Config::try_deserialize) {
            Ok(settings) => settings,
            Err(err) => Self::warn_and_default(err),
        }
    }

    fn with_defaults(
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let d = Self::default();
        builder
            .set_default("moderation_max_chars", d.max_chars as u64)?
            .set_default("moderation_mute_duration_secs", d.mute_duration_secs)?
            .set_default("moderation_link_ban_threshold", u64::from(d.link_ban_threshold))?
            .set_default("moderation_bot_detection_enabled", d.bot_detection_enabled)?
            .set_default("moderation_rapid_message_count", d.rapid_message_count as u64)?
            .set_default("moderation_rapid_message_span_ms", d.rapid_message_span_ms)?
            .set_default("moderation_message_window", d.message_window as u64)?
            .set_default("moderation_rapid_edit_count", d.rapid_edit_count as u64)?
            .set_default("moderation_rapid_edit_span_ms", d.rapid_edit_span_ms)?
            .set_default("moderation_edit_idle_secs", d.edit_idle_secs)?
            .set_default("moderation_scan_page_size", d.scan_page_size as u64)?
            .set_default("moderation_scan_max_pages", d.scan_max_pages as u64)?
            .set_default("moderation_scan_delete_pause_ms", d.scan_delete_pause_ms)?
            .set_default(
                "moderation_admin_roster_ttl_secs",
                d.admin_roster_ttl_secs,
            )
    }

    fn warn_and_default(err: ConfigError) -> Self {
        warn!(error = %err, "Failed to load moderation config, using defaults");
        Self::default()
    }

    /// Mute duration as a chrono span
    #[must_use]
    pub fn mute_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.mute_duration_secs).unwrap_or(i64::MAX / 1000))
    }

    /// Pause between scan deletes
    #[must_use]
    pub fn scan_delete_pause(&self) -> Duration {
        Duration::from_millis(self.scan_delete_pause_ms)
    }
}

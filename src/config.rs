//! Configuration and settings management
//!
//! Loads settings from environment variables and defines runtime constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Phone number of the account this process connects as (digits)
    pub owner_phone: Option<String>,

    /// Document store backend: `r2` or `memory`
    #[serde(default = "default_store_backend")]
    pub store_backend: String,

    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,
    /// Key prefix under which every collection is stored
    #[serde(default = "default_r2_key_prefix")]
    pub r2_key_prefix: String,

    /// Directory holding per-session credential directories
    #[serde(default = "default_auth_root")]
    pub auth_root: String,

    /// AI chat endpoint URL
    pub ai_endpoint_url: Option<String>,
    /// Bearer token for the AI chat endpoint
    pub ai_api_key: Option<String>,
    /// Reply to every group message instead of only replies to the bot
    #[serde(default)]
    pub ai_reply_all_groups: bool,

    /// Command line of the transport bridge process
    pub bridge_command: Option<String>,

    /// Start a fresh session after the account logs out
    #[serde(default = "default_true")]
    pub restart_after_logout: bool,
}

/// Supported document store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Cloudflare R2 / S3 compatible object storage
    R2,
    /// Process-local store, lost on exit
    Memory,
}

fn default_store_backend() -> String {
    "r2".to_string()
}

fn default_r2_key_prefix() -> String {
    "chatguard".to_string()
}

fn default_auth_root() -> String {
    ".".to_string()
}

const fn default_true() -> bool {
    true
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chatguard::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, never checked in
            .add_source(File::with_name("config/local").required(false))
            // APP_ prefixed variables, e.g. `APP_AUTH_ROOT=/data`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Bare variables; UPPER_SNAKE_CASE maps to snake_case, empty counts as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Fallback: read R2 variables directly if the layered config missed them
        fill_from_env(&mut settings.r2_endpoint_url, "R2_ENDPOINT_URL");
        fill_from_env(&mut settings.r2_access_key_id, "R2_ACCESS_KEY_ID");
        fill_from_env(&mut settings.r2_secret_access_key, "R2_SECRET_ACCESS_KEY");
        fill_from_env(&mut settings.r2_bucket_name, "R2_BUCKET_NAME");

        Ok(settings)
    }

    /// Owner phone number reduced to digits, if configured
    #[must_use]
    pub fn owner_phone_digits(&self) -> Option<String> {
        self.owner_phone
            .as_deref()
            .map(|p| p.chars().filter(char::is_ascii_digit).collect::<String>())
            .filter(|p| !p.is_empty())
    }

    /// Selected store backend; unknown values fall back to R2
    #[must_use]
    pub fn store_backend(&self) -> StoreBackend {
        match self.store_backend.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => StoreBackend::Memory,
            _ => StoreBackend::R2,
        }
    }

    /// Root directory for credential directories
    #[must_use]
    pub fn auth_root(&self) -> PathBuf {
        PathBuf::from(&self.auth_root)
    }
}

fn fill_from_env(slot: &mut Option<String>, var: &str) {
    if slot.is_some() {
        return;
    }
    if let Ok(val) = std::env::var(var) {
        if !val.is_empty() {
            *slot = Some(val);
        }
    }
}

// Durable store layout
/// Collection holding one metadata document per session
pub const SESSIONS_META_COLLECTION: &str = "sessions_metadata";
/// Prefix of each session's credential document collection
pub const SESSION_DATA_PREFIX: &str = "session_data_";
/// Collection holding per-chat AI conversation history
pub const CHAT_HISTORY_COLLECTION: &str = "chat_history";

// Store API retry configuration
/// Maximum retries for store operations that are safe to repeat
pub const STORE_API_MAX_RETRIES: usize = 3;
/// Initial backoff for store retries
pub const STORE_API_INITIAL_BACKOFF_MS: u64 = 200;
/// Backoff ceiling for store retries
pub const STORE_API_MAX_BACKOFF_MS: u64 = 2_000;

// Transport send retry configuration
/// Maximum retries for outgoing messages
pub const TRANSPORT_SEND_MAX_RETRIES: usize = 3;
/// Initial backoff for send retries
pub const TRANSPORT_SEND_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling for send retries
pub const TRANSPORT_SEND_MAX_BACKOFF_MS: u64 = 4_000;

// AI chat
/// Request timeout for the AI endpoint
pub const AI_TIMEOUT_SECS: u64 = 30;
/// Number of history entries sent along with each prompt
pub const AI_HISTORY_WINDOW: usize = 6;
/// Number of history entries kept per chat
pub const CHAT_HISTORY_LIMIT: usize = 10;

// Transport bridge
/// Time a bridge request may take before it is abandoned
pub const BRIDGE_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Buffered events between the bridge reader and the supervisor
pub const BRIDGE_EVENT_BUFFER: usize = 256;

// Bot message tracking
/// How long sent message ids are remembered for reply detection
pub const BOT_MESSAGE_TTL_SECS: u64 = 60;
/// Upper bound on tracked message ids
pub const BOT_MESSAGE_TRACKER_MAX: u64 = 10_000;
/// How long shutdown waits for in-flight replies and scans
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Single test: environment variables are process-global
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("R2_BUCKET_NAME", "sessions-bucket");
        env::set_var("OWNER_PHONE", "+234 801-234-5678");

        let settings = Settings::new()?;
        assert_eq!(settings.r2_bucket_name, Some("sessions-bucket".to_string()));
        assert_eq!(
            settings.owner_phone_digits(),
            Some("2348012345678".to_string())
        );
        assert!(settings.restart_after_logout);
        assert_eq!(settings.r2_key_prefix, "chatguard");

        env::remove_var("R2_BUCKET_NAME");
        env::remove_var("OWNER_PHONE");

        env::set_var("R2_BUCKET_NAME", "");
        let settings = Settings::new()?;
        assert_eq!(settings.r2_bucket_name, None);
        env::remove_var("R2_BUCKET_NAME");
        Ok(())
    }

    #[test]
    fn test_store_backend_parsing() {
        let mut settings = Settings {
            owner_phone: None,
            store_backend: "memory".to_string(),
            r2_access_key_id: None,
            r2_secret_access_key: None,
            r2_endpoint_url: None,
            r2_bucket_name: None,
            r2_key_prefix: default_r2_key_prefix(),
            auth_root: default_auth_root(),
            ai_endpoint_url: None,
            ai_api_key: None,
            ai_reply_all_groups: false,
            bridge_command: None,
            restart_after_logout: true,
        };
        assert_eq!(settings.store_backend(), StoreBackend::Memory);

        settings.store_backend = " R2 ".to_string();
        assert_eq!(settings.store_backend(), StoreBackend::R2);

        settings.store_backend = "mongo".to_string();
        assert_eq!(settings.store_backend(), StoreBackend::R2);

        settings.owner_phone = Some("no digits".to_string());
        assert_eq!(settings.owner_phone_digits(), None);
    }
}

//! Session identifiers, metadata records and credential documents.

use crate::config::SESSION_DATA_PREFIX;
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by session continuity and the registry
#[derive(Debug, Error)]
pub enum SessionError {
    /// Durable store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// Local filesystem failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// A critical credential file could not be restored
    #[error("Critical credential file {file} failed to load: {reason}")]
    CriticalFile {
        /// Document key / file name
        file: String,
        /// Failure description
        reason: String,
    },
    /// No metadata exists for the session
    #[error("Session not found: {0}")]
    NotFound(String),
}

impl SessionError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Identifier of a logical session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `session_<digits>` for a known phone number
    #[must_use]
    pub fn for_phone(phone: &str) -> Self {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        Self(format!("session_{digits}"))
    }

    /// `session_<host hash>_<millis>` when no phone number is known
    #[must_use]
    pub fn for_host(host: &HostFingerprint, now: DateTime<Utc>) -> Self {
        Self(format!("session_{}_{}", host.short_hash(), now.timestamp_millis()))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Document collection holding this session's credential files
    #[must_use]
    pub fn data_collection(&self) -> String {
        format!("{SESSION_DATA_PREFIX}{}", self.0)
    }

    /// Credential directory for this session under `root`
    #[must_use]
    pub fn credential_dir(&self, root: &Path) -> PathBuf {
        root.join(format!("auth_{}", self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host identity used to name phone-less sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFingerprint {
    /// Machine host name
    pub hostname: String,
    /// Operating system
    pub platform: String,
    /// CPU architecture
    pub arch: String,
}

impl HostFingerprint {
    /// Fingerprint of the current machine
    #[must_use]
    pub fn current() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            hostname,
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// First 8 hex digits of the SHA-256 of host, platform and arch
    #[must_use]
    pub fn short_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hostname.as_bytes());
        hasher.update(self.platform.as_bytes());
        hasher.update(self.arch.as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
    }
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Registered, handshake not yet complete
    Initializing,
    /// Connection open
    Active,
    /// Connection lost
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Session metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session id
    pub session_id: SessionId,
    /// Phone number (digits) once known
    pub phone_number: Option<String>,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last metadata update
    pub last_active: DateTime<Utc>,
    /// Last successful credential sync
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Last successful handshake
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    /// Last connection loss
    #[serde(default)]
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Host that created the session
    pub hostname: String,
    /// OS of that host
    pub platform: String,
}

impl SessionRecord {
    /// Fresh `initializing` record
    #[must_use]
    pub fn new(
        session_id: SessionId,
        phone_number: Option<String>,
        host: &HostFingerprint,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            phone_number,
            status: SessionStatus::Initializing,
            created_at: now,
            last_active: now,
            last_sync: None,
            connected_at: None,
            disconnected_at: None,
            hostname: host.hostname.clone(),
            platform: host.platform.clone(),
        }
    }
}

/// One credential file as stored in the session's data collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDocument {
    /// File contents
    pub data: String,
    /// Time of the sync that wrote this document
    pub updated_at: DateTime<Utc>,
    /// Owning session
    pub session_id: SessionId,
}

/// Outcome of a credential sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Files written to the store
    pub synced: usize,
    /// Files that failed and were skipped
    pub skipped: usize,
}

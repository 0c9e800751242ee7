//! Session continuity: mirroring a credential directory to durable storage.
//!
//! Each manager is bound to one session. Loads and syncs for that session
//! run one at a time; different sessions never share a manager.

use super::config::SessionConfig;
use super::registry::SessionRegistry;
use super::types::{
    CredentialDocument, HostFingerprint, SessionError, SessionId, SessionRecord, SessionStatus,
    SyncSummary,
};
use crate::storage::{DocumentStore, StorageError, StoredDocument};
use crate::utils::retry_store_operation;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Time of the last successful credential sync, shared process-wide
#[derive(Debug, Clone)]
pub struct SyncClock {
    last_sync_ms: Arc<AtomicI64>,
    started: DateTime<Utc>,
}

const NEVER: i64 = i64::MIN;

impl SyncClock {
    /// Clock with no sync recorded
    #[must_use]
    pub fn new(started: DateTime<Utc>) -> Self {
        Self {
            last_sync_ms: Arc::new(AtomicI64::new(NEVER)),
            started,
        }
    }

    /// Record a successful sync
    pub fn mark(&self, at: DateTime<Utc>) {
        self.last_sync_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Last successful sync, if any
    #[must_use]
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        match self.last_sync_ms.load(Ordering::Relaxed) {
            NEVER => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Time since the last sync, or since the clock started if none happened
    #[must_use]
    pub fn since_last_sync(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_sync().unwrap_or(self.started)
    }
}

/// Keeps one session's credential directory mirrored in the document store
pub struct SessionContinuityManager {
    id: SessionId,
    phone: Option<String>,
    registry: SessionRegistry,
    critical_files: Vec<String>,
    clock: SyncClock,
    io_lock: Mutex<()>,
}

impl SessionContinuityManager {
    /// Resume the active session for `phone`, or register a new one.
    ///
    /// New ids are derived from the phone digits, or from a host hash plus
    /// the current time when no phone is known.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read or written.
    pub async fn initialize(
        registry: SessionRegistry,
        clock: SyncClock,
        config: &SessionConfig,
        phone: Option<&str>,
    ) -> Result<Self, SessionError> {
        let now = Utc::now();
        let phone = phone.map(str::to_string);

        if let Some(phone) = phone.as_deref() {
            if let Some(existing) = registry.find_active_by_phone(phone).await? {
                info!(session_id = %existing.session_id, "📱 Recovering existing session");
                registry.update(&existing.session_id, now, |_| {}).await?;
                return Ok(Self::bind(existing.session_id, Some(phone.to_string()), registry, clock, config));
            }
        }

        let host = HostFingerprint::current();
        let id = match phone.as_deref() {
            Some(phone) => SessionId::for_phone(phone),
            None => SessionId::for_host(&host, now),
        };
        registry
            .register(&SessionRecord::new(id.clone(), phone.clone(), &host, now))
            .await?;
        info!(session_id = %id, "🆕 Created new session");
        Ok(Self::bind(id, phone, registry, clock, config))
    }

    /// Bind to an existing session by id
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the session has no metadata.
    pub async fn attach(
        registry: SessionRegistry,
        clock: SyncClock,
        config: &SessionConfig,
        id: SessionId,
    ) -> Result<Self, SessionError> {
        let record = registry
            .get(&id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(Self::bind(id, record.phone_number, registry, clock, config))
    }

    fn bind(
        id: SessionId,
        phone: Option<String>,
        registry: SessionRegistry,
        clock: SyncClock,
        config: &SessionConfig,
    ) -> Self {
        Self {
            id,
            phone,
            registry,
            critical_files: config.critical_files(),
            clock,
            io_lock: Mutex::new(()),
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Phone number the session was opened for
    #[must_use]
    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    /// Shared sync clock
    #[must_use]
    pub fn clock(&self) -> &SyncClock {
        &self.clock
    }

    fn store(&self) -> &Arc<dyn DocumentStore> {
        self.registry.store()
    }

    fn is_critical(&self, file: &str) -> bool {
        self.critical_files.iter().any(|c| c == file)
    }

    /// Restore stored credential files into `dir`.
    ///
    /// Returns `false` when nothing is stored (fresh login required).
    /// Critical files are written and read back first; any failure on one
    /// aborts the load. Other files are best effort.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, the directory cannot be
    /// created, or a critical file fails.
    pub async fn load_from_durable_store(&self, dir: &Path) -> Result<bool, SessionError> {
        let _guard = self.io_lock.lock().await;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SessionError::io(dir, e))?;

        let collection = self.id.data_collection();
        let docs = retry_store_operation(|| self.store().find_all(&collection)).await?;
        if docs.is_empty() {
            info!(session_id = %self.id, "📝 No stored credentials, fresh login required");
            return Ok(false);
        }

        let (critical, rest): (Vec<&StoredDocument>, Vec<&StoredDocument>) =
            docs.iter().partition(|doc| self.is_critical(&doc.key));

        for doc in &critical {
            restore_file(dir, doc, true).await.map_err(|reason| {
                error!(session_id = %self.id, file = %doc.key, %reason, "❌ Failed to load critical file");
                SessionError::CriticalFile {
                    file: doc.key.clone(),
                    reason,
                }
            })?;
        }

        let mut loaded = critical.len();
        for doc in &rest {
            match restore_file(dir, doc, false).await {
                Ok(()) => loaded += 1,
                Err(reason) => warn!(file = %doc.key, %reason, "⚠️ Skipping credential file"),
            }
        }

        info!(session_id = %self.id, files = loaded, "📥 Session loaded");
        Ok(true)
    }

    /// Upload every file in `dir` to the store.
    ///
    /// Per-file failures are logged and skipped. A missing directory syncs
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory cannot be listed.
    pub async fn sync_to_durable_store(&self, dir: &Path) -> Result<SyncSummary, SessionError> {
        let _guard = self.io_lock.lock().await;

        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            debug!(dir = %dir.display(), "Credential directory missing, nothing to sync");
            return Ok(SyncSummary::default());
        }

        let files = list_files(dir).await?;
        let now = Utc::now();
        let collection = self.id.data_collection();

        let results = join_all(files.iter().map(|(name, path)| {
            let collection = collection.as_str();
            async move {
                let outcome = self.sync_file(collection, name, path, now).await;
                if let Err(e) = &outcome {
                    warn!(file = %name, error = %e, "⚠️ Skipping file");
                }
                outcome.is_ok()
            }
        }))
        .await;

        let synced = results.iter().filter(|ok| **ok).count();
        let summary = SyncSummary {
            synced,
            skipped: results.len() - synced,
        };

        if let Err(e) = self
            .registry
            .update(&self.id, now, |r| r.last_sync = Some(now))
            .await
        {
            warn!(session_id = %self.id, error = %e, "Failed to record sync time");
        }
        self.clock.mark(now);
        info!(
            session_id = %self.id,
            synced = summary.synced,
            skipped = summary.skipped,
            "✅ Credentials synced"
        );
        Ok(summary)
    }

    async fn sync_file(
        &self,
        collection: &str,
        name: &str,
        path: &Path,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SessionError::io(path, e))?;
        let doc = CredentialDocument {
            data,
            updated_at: now,
            session_id: self.id.clone(),
        };
        let body = serde_json::to_vec(&doc).map_err(StorageError::from)?;
        retry_store_operation(|| self.store().upsert(collection, name, body.clone())).await?;
        Ok(())
    }

    /// Mark the session active under `phone` (or the phone it was opened for)
    pub async fn mark_active(&self, phone: Option<&str>) {
        let now = Utc::now();
        let phone = phone.map(str::to_string).or_else(|| self.phone.clone());
        let result = self
            .registry
            .update(&self.id, now, |r| {
                r.status = SessionStatus::Active;
                r.connected_at = Some(now);
                if phone.is_some() {
                    r.phone_number = phone;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(session_id = %self.id, error = %e, "⚠️ Metadata update error");
        }
    }

    /// Mark the session disconnected
    pub async fn mark_disconnected(&self) {
        let now = Utc::now();
        let result = self
            .registry
            .update(&self.id, now, |r| {
                r.status = SessionStatus::Disconnected;
                r.disconnected_at = Some(now);
            })
            .await;
        if let Err(e) = result {
            warn!(session_id = %self.id, error = %e, "⚠️ Metadata update error");
        }
    }

    /// Remove the session's documents and metadata
    ///
    /// # Errors
    ///
    /// Returns an error if the store deletes fail.
    pub async fn delete(&self) -> Result<(), SessionError> {
        let _guard = self.io_lock.lock().await;
        self.registry.delete_session(&self.id).await
    }
}

/// Regular files in `dir`, sorted by name
async fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, SessionError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SessionError::io(dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SessionError::io(dir, e))?
    {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((name.to_string(), entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

/// Write one stored document back as a file; `verify` reads it back.
async fn restore_file(dir: &Path, doc: &StoredDocument, verify: bool) -> Result<(), String> {
    if !is_plain_file_name(&doc.key) {
        return Err(format!("refusing unsafe file name {:?}", doc.key));
    }
    let stored: CredentialDocument =
        serde_json::from_slice(&doc.body).map_err(|e| format!("undecodable document: {e}"))?;
    let path = dir.join(&doc.key);
    tokio::fs::write(&path, stored.data.as_bytes())
        .await
        .map_err(|e| format!("write failed: {e}"))?;

    if verify {
        let written = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("read-back failed: {e}"))?;
        if written != stored.data.as_bytes() {
            return Err("read-back mismatch".to_string());
        }
    }
    Ok(())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDocumentStore;

    fn registry() -> (Arc<MemoryDocumentStore>, SessionRegistry) {
        let store = Arc::new(MemoryDocumentStore::new());
        (store.clone(), SessionRegistry::new(store))
    }

    #[tokio::test]
    async fn initialize_resumes_active_session_for_phone() -> Result<(), SessionError> {
        let (_, registry) = registry();
        let config = SessionConfig::default();
        let clock = SyncClock::new(Utc::now());

        let first = SessionContinuityManager::initialize(registry.clone(), clock.clone(), &config, Some("2348012345678")).await?;
        assert_eq!(first.id().as_str(), "session_2348012345678");
        first.mark_active(None).await;

        let second = SessionContinuityManager::initialize(registry.clone(), clock, &config, Some("2348012345678")).await?;
        assert_eq!(second.id(), first.id());
        Ok(())
    }

    #[tokio::test]
    async fn empty_store_means_fresh_login() -> Result<(), Box<dyn std::error::Error>> {
        let (_, registry) = registry();
        let dir = tempfile::tempdir()?;
        let manager = SessionContinuityManager::initialize(
            registry,
            SyncClock::new(Utc::now()),
            &SessionConfig::default(),
            None,
        )
        .await?;
        assert!(!manager.load_from_durable_store(dir.path()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_critical_file_aborts_load() -> Result<(), Box<dyn std::error::Error>> {
        let (store, registry) = registry();
        let manager = SessionContinuityManager::initialize(
            registry,
            SyncClock::new(Utc::now()),
            &SessionConfig::default(),
            Some("1"),
        )
        .await?;
        let collection = manager.id().data_collection();
        store.upsert(&collection, "creds.json", b"not json".to_vec()).await?;

        let dir = tempfile::tempdir()?;
        let result = manager.load_from_durable_store(dir.path()).await;
        assert!(matches!(result, Err(SessionError::CriticalFile { ref file, .. }) if file == "creds.json"));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_optional_file_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let (store, registry) = registry();
        let manager = SessionContinuityManager::initialize(
            registry,
            SyncClock::new(Utc::now()),
            &SessionConfig::default(),
            Some("2"),
        )
        .await?;
        let collection = manager.id().data_collection();
        store.upsert(&collection, "pre-key-1.json", b"garbage".to_vec()).await?;
        store.upsert(&collection, "../escape.json", b"{}".to_vec()).await?;

        let dir = tempfile::tempdir()?;
        assert!(manager.load_from_durable_store(dir.path()).await?);
        assert!(!dir.path().join("pre-key-1.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn sync_records_clock_and_metadata() -> Result<(), Box<dyn std::error::Error>> {
        let (store, registry) = registry();
        let clock = SyncClock::new(Utc::now());
        let manager = SessionContinuityManager::initialize(
            registry.clone(),
            clock.clone(),
            &SessionConfig::default(),
            Some("3"),
        )
        .await?;

        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("creds.json"), "{\"me\":1}")?;
        std::fs::write(dir.path().join("app-state.json"), "{}")?;
        std::fs::create_dir(dir.path().join("nested"))?;

        let summary = manager.sync_to_durable_store(dir.path()).await?;
        assert_eq!(summary, SyncSummary { synced: 2, skipped: 0 });
        assert_eq!(store.document_count(&manager.id().data_collection()).await, 2);
        assert!(clock.last_sync().is_some());

        let record = registry.get(manager.id()).await?;
        assert!(record.and_then(|r| r.last_sync).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_syncs_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let (_, registry) = registry();
        let manager = SessionContinuityManager::initialize(
            registry,
            SyncClock::new(Utc::now()),
            &SessionConfig::default(),
            Some("4"),
        )
        .await?;
        let dir = tempfile::tempdir()?;
        let summary = manager.sync_to_durable_store(&dir.path().join("absent")).await?;
        assert_eq!(summary, SyncSummary::default());
        Ok(())
    }

    #[tokio::test]
    async fn lifecycle_status_transitions() -> Result<(), SessionError> {
        let (_, registry) = registry();
        let manager = SessionContinuityManager::initialize(
            registry.clone(),
            SyncClock::new(Utc::now()),
            &SessionConfig::default(),
            None,
        )
        .await?;
        let id = manager.id().clone();

        assert_eq!(status_of(&registry, &id).await?, Some(SessionStatus::Initializing));
        manager.mark_active(Some("99")).await;
        assert_eq!(status_of(&registry, &id).await?, Some(SessionStatus::Active));
        manager.mark_disconnected().await;
        assert_eq!(status_of(&registry, &id).await?, Some(SessionStatus::Disconnected));
        manager.delete().await?;
        assert_eq!(status_of(&registry, &id).await?, None);
        Ok(())
    }

    async fn status_of(
        registry: &SessionRegistry,
        id: &SessionId,
    ) -> Result<Option<SessionStatus>, SessionError> {
        Ok(registry.get(id).await?.map(|r| r.status))
    }

    #[test]
    fn clock_reports_elapsed_since_start_until_first_sync() {
        let start = Utc::now();
        let clock = SyncClock::new(start);
        assert!(clock.last_sync().is_none());
        assert_eq!(
            clock.since_last_sync(start + chrono::Duration::minutes(3)),
            chrono::Duration::minutes(3)
        );
        clock.mark(start + chrono::Duration::minutes(2));
        assert_eq!(
            clock.since_last_sync(start + chrono::Duration::minutes(3)),
            chrono::Duration::minutes(1)
        );
    }
}

//! Durable catalog of known sessions.

use super::types::{SessionError, SessionId, SessionRecord, SessionStatus};
use crate::config::SESSIONS_META_COLLECTION;
use crate::storage::{DocumentStore, StorageError};
use crate::utils::retry_store_operation;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

const INDEXED_FIELDS: [&str; 4] = ["sessionId", "phoneNumber", "lastActive", "status"];

/// Session metadata stored one document per session, keyed by session id
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn DocumentStore>,
}

impl SessionRegistry {
    /// Create a registry over `store`
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Underlying document store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Declare lookup indexes on the metadata collection
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects an index.
    pub async fn ensure_indexes(&self) -> Result<(), SessionError> {
        for field in INDEXED_FIELDS {
            self.store
                .create_index(SESSIONS_META_COLLECTION, field)
                .await?;
        }
        debug!("Session metadata indexes ensured");
        Ok(())
    }

    /// Metadata of one session
    ///
    /// # Errors
    ///
    /// Returns an error if the read or decode fails.
    pub async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, SessionError> {
        let body = retry_store_operation(|| self.store.get(SESSIONS_META_COLLECTION, id.as_str())).await?;
        match body {
            Some(body) => Ok(Some(decode(&body)?)),
            None => Ok(None),
        }
    }

    /// Every known session, most recently active first.
    ///
    /// Undecodable documents are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be read.
    pub async fn list(&self) -> Result<Vec<SessionRecord>, SessionError> {
        let docs = retry_store_operation(|| self.store.find_all(SESSIONS_META_COLLECTION)).await?;
        let mut records: Vec<SessionRecord> = docs
            .iter()
            .filter_map(|doc| match decode(&doc.body) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %doc.key, error = %e, "Skipping unreadable session metadata");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(records)
    }

    /// Active session registered for `phone`, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be read.
    pub async fn find_active_by_phone(&self, phone: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.list().await?.into_iter().find(|r| {
            r.status == SessionStatus::Active && r.phone_number.as_deref() == Some(phone)
        }))
    }

    /// Insert or replace a metadata document
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn register(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let body = serde_json::to_vec_pretty(record).map_err(StorageError::from)?;
        retry_store_operation(|| {
            self.store
                .upsert(SESSIONS_META_COLLECTION, record.session_id.as_str(), body.clone())
        })
        .await?;
        Ok(())
    }

    /// Apply `change` to a session's metadata and bump `lastActive`.
    ///
    /// Returns `false` if the session has no metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub async fn update<F>(&self, id: &SessionId, now: DateTime<Utc>, change: F) -> Result<bool, SessionError>
    where
        F: FnOnce(&mut SessionRecord) + Send,
    {
        let Some(mut record) = self.get(id).await? else {
            warn!(session_id = %id, "Metadata update for unknown session");
            return Ok(false);
        };
        change(&mut record);
        record.last_active = now;
        self.register(&record).await?;
        Ok(true)
    }

    /// Remove a session's credential documents and metadata
    ///
    /// # Errors
    ///
    /// Returns an error if either delete fails.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), SessionError> {
        let collection = id.data_collection();
        retry_store_operation(|| self.store.delete_all(&collection)).await?;
        retry_store_operation(|| self.store.delete(SESSIONS_META_COLLECTION, id.as_str())).await?;
        info!(session_id = %id, "🗑️ Session deleted");
        Ok(())
    }

    /// Remove non-active sessions idle for more than `max_age_days`.
    ///
    /// Per-session failures are logged and skipped. Returns the number of
    /// sessions removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata collection cannot be read.
    pub async fn cleanup_old(&self, max_age_days: i64, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let cutoff = now - Duration::days(max_age_days);
        let mut removed = 0;
        for record in self.list().await? {
            if record.status == SessionStatus::Active || record.last_active >= cutoff {
                continue;
            }
            match self.delete_session(&record.session_id).await {
                Ok(()) => {
                    removed += 1;
                    info!(session_id = %record.session_id, "🧹 Cleaned up old session");
                }
                Err(e) => {
                    warn!(session_id = %record.session_id, error = %e, "⚠️ Error cleaning session");
                }
            }
        }
        Ok(removed)
    }
}

fn decode(body: &[u8]) -> Result<SessionRecord, SessionError> {
    serde_json::from_slice(body).map_err(|e| SessionError::Storage(StorageError::Json(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::HostFingerprint;
    use crate::storage::{MemoryDocumentStore, MockDocumentStore};

    fn record(id: &str, phone: Option<&str>, status: SessionStatus, last_active: DateTime<Utc>) -> SessionRecord {
        let mut record = SessionRecord::new(
            SessionId::new(id),
            phone.map(str::to_string),
            &HostFingerprint::current(),
            last_active,
        );
        record.status = status;
        record
    }

    #[tokio::test]
    async fn finds_only_active_sessions_for_phone() -> Result<(), SessionError> {
        let registry = SessionRegistry::new(Arc::new(MemoryDocumentStore::new()));
        let now = Utc::now();
        registry
            .register(&record("a", Some("1"), SessionStatus::Disconnected, now))
            .await?;
        assert!(registry.find_active_by_phone("1").await?.is_none());

        registry
            .register(&record("b", Some("1"), SessionStatus::Active, now))
            .await?;
        let found = registry.find_active_by_phone("1").await?;
        assert_eq!(found.map(|r| r.session_id), Some(SessionId::new("b")));
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_skips_active_and_recent_sessions() -> Result<(), SessionError> {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = SessionRegistry::new(store.clone());
        let now = Utc::now();
        let old = now - Duration::days(8);

        registry.register(&record("old", None, SessionStatus::Disconnected, old)).await?;
        registry.register(&record("live", None, SessionStatus::Active, old)).await?;
        registry.register(&record("fresh", None, SessionStatus::Disconnected, now)).await?;
        store
            .upsert(&SessionId::new("old").data_collection(), "creds.json", b"{}".to_vec())
            .await?;

        assert_eq!(registry.cleanup_old(7, now).await?, 1);
        let left: Vec<_> = registry.list().await?.into_iter().map(|r| r.session_id).collect();
        assert_eq!(left.len(), 2);
        assert!(!left.contains(&SessionId::new("old")));
        assert_eq!(store.document_count(&SessionId::new("old").data_collection()).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn update_bumps_last_active() -> Result<(), SessionError> {
        let registry = SessionRegistry::new(Arc::new(MemoryDocumentStore::new()));
        let then = Utc::now() - Duration::hours(1);
        registry.register(&record("s", None, SessionStatus::Initializing, then)).await?;

        let now = Utc::now();
        let updated = registry
            .update(&SessionId::new("s"), now, |r| r.status = SessionStatus::Active)
            .await?;
        assert!(updated);
        let stored = registry.get(&SessionId::new("s")).await?;
        assert_eq!(stored.as_ref().map(|r| r.status), Some(SessionStatus::Active));
        assert_eq!(stored.map(|r| r.last_active), Some(now));

        assert!(!registry.update(&SessionId::new("missing"), now, |_| {}).await?);
        Ok(())
    }

    #[tokio::test]
    async fn ensure_indexes_declares_lookup_fields() -> Result<(), SessionError> {
        let store = Arc::new(MemoryDocumentStore::new());
        SessionRegistry::new(store.clone()).ensure_indexes().await?;
        assert_eq!(store.indexes(SESSIONS_META_COLLECTION).await, INDEXED_FIELDS.to_vec());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn list_failure_is_propagated_after_retries() {
        let mut store = MockDocumentStore::new();
        store
            .expect_find_all()
            .returning(|_| Err(StorageError::S3List("down".into())));
        let registry = SessionRegistry::new(Arc::new(store));
        assert!(registry.list().await.is_err());
    }
}

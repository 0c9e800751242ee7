//! Document storage layer
//!
//! A minimal document-collection store: documents are byte bodies addressed
//! by `(collection, key)`. The production backend is Cloudflare R2 / AWS S3;
//! an in-memory backend serves tests and local runs.

use crate::config::Settings;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error retrieving object from S3
    #[error("S3 Get error: {0}")]
    S3Get(Box<SdkError<GetObjectError>>),
    /// Error putting object into S3
    #[error("S3 put error: {0}")]
    S3Put(String),
    /// Error listing objects in S3
    #[error("S3 list error: {0}")]
    S3List(String),
    /// Error deleting object from S3
    #[error("S3 delete error: {0}")]
    S3Delete(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A stored document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Document key within its collection
    pub key: String,
    /// Raw body
    pub body: Vec<u8>,
}

/// Interface for document store providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document
    async fn upsert(&self, collection: &str, key: &str, body: Vec<u8>)
        -> Result<(), StorageError>;
    /// Fetch a single document
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Fetch every document in a collection
    async fn find_all(&self, collection: &str) -> Result<Vec<StoredDocument>, StorageError>;
    /// Delete a document; missing documents are not an error
    async fn delete(&self, collection: &str, key: &str) -> Result<(), StorageError>;
    /// Delete a whole collection
    async fn delete_all(&self, collection: &str) -> Result<(), StorageError>;
    /// Declare a lookup index on a document field
    async fn create_index(&self, collection: &str, field: &str) -> Result<(), StorageError>;
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), String>;
}

/// Serialize `data` as JSON and upsert it
///
/// # Errors
///
/// Returns an error if serialization or the upsert fails.
pub async fn save_json<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    key: &str,
    data: &T,
) -> Result<(), StorageError> {
    let body = serde_json::to_vec_pretty(data)?;
    store.upsert(collection, key, body).await
}

/// Load and deserialize a JSON document
///
/// # Errors
///
/// Returns an error if the read or deserialization fails.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(collection, key).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}

/// R2-backed document store
///
/// Documents live at `{prefix}/{collection}/{key}`.
pub struct R2DocumentStore {
    client: Client,
    bucket: String,
    prefix: String,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl R2DocumentStore {
    /// Create a new R2 store instance
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &Settings) -> Result<Self, StorageError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-storage");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(60 * 60)) // 1 hour
            .time_to_idle(Duration::from_secs(30 * 60)) // 30 minutes
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.clone(),
            prefix: settings.r2_key_prefix.trim_matches('/').to_string(),
            cache,
        })
    }

    fn collection_prefix(&self, collection: &str) -> String {
        format!("{}/{collection}/", self.prefix)
    }

    fn object_key(&self, collection: &str, key: &str) -> String {
        format!("{}{key}", self.collection_prefix(collection))
    }

    async fn list_keys(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let prefix = self.collection_prefix(collection);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::S3List(e.to_string()))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(str::to_string),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn get_object(&self, object_key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        // Read-Through: Check cache first
        if let Some(cached) = self.cache.get(object_key).await {
            return Ok(Some(cached.as_ref().clone()));
        }

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                    .into_bytes()
                    .to_vec();

                self.cache
                    .insert(object_key.to_string(), Arc::new(data.clone()))
                    .await;
                Ok(Some(data))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(StorageError::S3Get(Box::new(e))),
        }
    }

    async fn delete_object(&self, object_key: &str) -> Result<(), StorageError> {
        self.cache.invalidate(object_key).await;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| StorageError::S3Delete(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for R2DocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), StorageError> {
        let object_key = self.object_key(collection, key);

        // Write-Through: Update cache immediately
        self.cache
            .insert(object_key.clone(), Arc::new(body.clone()))
            .await;

        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(body))
            .send()
            .await;

        if let Err(e) = put {
            self.cache.invalidate(&object_key).await;
            return Err(StorageError::S3Put(e.to_string()));
        }
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.get_object(&self.object_key(collection, key)).await
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<StoredDocument>, StorageError> {
        let prefix = self.collection_prefix(collection);
        let mut documents = Vec::new();

        for object_key in self.list_keys(collection).await? {
            let Some(key) = object_key.strip_prefix(&prefix).map(str::to_string) else {
                continue;
            };
            // Listed objects may disappear before we read them
            if let Some(body) = self.get_object(&object_key).await? {
                documents.push(StoredDocument { key, body });
            }
        }

        Ok(documents)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StorageError> {
        self.delete_object(&self.object_key(collection, key)).await
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StorageError> {
        let keys = self.list_keys(collection).await?;
        let count = keys.len();
        for object_key in keys {
            self.delete_object(&object_key).await?;
        }
        debug!(collection, count, "Dropped collection");
        Ok(())
    }

    async fn create_index(&self, collection: &str, field: &str) -> Result<(), StorageError> {
        // Object storage is addressed by key only; lookups scan the collection
        debug!(collection, field, "Index request ignored by R2 backend");
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), String> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("Successfully connected to R2 storage.");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(err_msg)
            }
        }
    }
}

/// Process-local document store
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    indexes: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryDocumentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub async fn document_count(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Fields indexed on a collection
    pub async fn indexes(&self, collection: &str) -> Vec<String> {
        let indexes = self.indexes.read().await;
        indexes.get(collection).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), StorageError> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn find_all(&self, collection: &str) -> Result<Vec<StoredDocument>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(key, body)| StoredDocument {
                        key: key.clone(),
                        body: body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StorageError> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(key);
        }
        Ok(())
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StorageError> {
        let mut collections = self.collections.write().await;
        if collections.remove(collection).is_none() {
            warn!(collection, "Dropping a collection that does not exist");
        }
        Ok(())
    }

    async fn create_index(&self, collection: &str, field: &str) -> Result<(), StorageError> {
        let mut indexes = self.indexes.write().await;
        let fields = indexes.entry(collection.to_string()).or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), String> {
        Ok(())
    }
}

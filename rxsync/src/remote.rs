//! Remote document store
//!
//! The cloud side is a set of named collections holding JSON documents keyed
//! by record id. Writes are compare-and-set on the document `version` field so
//! the remote version only ever moves forward by one.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Header carrying the version the client expects the remote to hold
pub const EXPECTED_VERSION_HEADER: &str = "x-expected-version";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, collection: &str, id: Uuid) -> SyncResult<Option<Value>>;

    async fn fetch_all(&self, collection: &str) -> SyncResult<Vec<Value>>;

    /// Write `doc` if the stored version equals `expected_version` (0 = absent).
    ///
    /// Fails with [`SyncError::VersionMismatch`] otherwise.
    async fn put(
        &self,
        collection: &str,
        id: Uuid,
        doc: &Value,
        expected_version: u64,
    ) -> SyncResult<()>;

    /// Remove a document; removing an absent document succeeds
    async fn delete(&self, collection: &str, id: Uuid) -> SyncResult<()>;
}

/// `version` field of a stored document, 0 when missing
pub fn document_version(doc: &Value) -> u64 {
    doc.get("version").and_then(Value::as_u64).unwrap_or(0)
}

/// In-process remote used by tests and the CLI demo mode
#[derive(Default)]
pub struct InMemoryRemote {
    collections: Mutex<HashMap<String, BTreeMap<Uuid, Value>>>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a network outage; every call fails with a transient error
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Successful puts and deletes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Overwrite a document without version checks, as another device would
    pub fn insert_raw(&self, collection: &str, id: Uuid, doc: Value) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id, doc);
    }

    pub fn get_raw(&self, collection: &str, id: Uuid) -> Option<Value> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|docs| docs.get(&id))
            .cloned()
    }

    fn ensure_available(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SyncError::Network("remote store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch(&self, collection: &str, id: Uuid) -> SyncResult<Option<Value>> {
        self.ensure_available()?;
        Ok(self.get_raw(collection, id))
    }

    async fn fetch_all(&self, collection: &str) -> SyncResult<Vec<Value>> {
        self.ensure_available()?;
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(
        &self,
        collection: &str,
        id: Uuid,
        doc: &Value,
        expected_version: u64,
    ) -> SyncResult<()> {
        self.ensure_available()?;

        let new_version = document_version(doc);
        if new_version != expected_version + 1 {
            return Err(SyncError::InvalidOperation(format!(
                "document version {} does not follow expected version {}",
                new_version, expected_version
            )));
        }

        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let current = docs.get(&id).map(document_version).unwrap_or(0);
        if current != expected_version {
            return Err(SyncError::VersionMismatch {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        docs.insert(id, doc.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: Uuid) -> SyncResult<()> {
        self.ensure_available()?;
        if let Some(docs) = self.collections.lock().get_mut(collection) {
            docs.remove(&id);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// HTTP document API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            auth_token: None,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionConflictBody {
    current_version: u64,
}

/// REST client for the remote document store
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<SecretString>,
}

impl HttpRemote {
    pub fn new(config: &HttpRemoteConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone().map(SecretString::new),
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn document_url(&self, collection: &str, id: Uuid) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn error_from(response: reqwest::Response) -> SyncError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        SyncError::Remote { status, message }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(&self, collection: &str, id: Uuid) -> SyncResult<Option<Value>> {
        let response = self
            .authorize(self.client.get(self.document_url(collection, id)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn fetch_all(&self, collection: &str) -> SyncResult<Vec<Value>> {
        let response = self
            .authorize(self.client.get(self.collection_url(collection)))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json().await?)
    }

    async fn put(
        &self,
        collection: &str,
        id: Uuid,
        doc: &Value,
        expected_version: u64,
    ) -> SyncResult<()> {
        let response = self
            .authorize(self.client.put(self.document_url(collection, id)))
            .header(EXPECTED_VERSION_HEADER, expected_version.to_string())
            .json(doc)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => {
                let body: VersionConflictBody = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Deserialization(format!("conflict body: {}", e)))?;
                Err(SyncError::VersionMismatch {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    expected: expected_version,
                    actual: body.current_version,
                })
            }
            status if status.is_success() => {
                tracing::debug!(collection = collection, id = %id, "Remote document written");
                Ok(())
            }
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn delete(&self, collection: &str, id: Uuid) -> SyncResult<()> {
        let response = self
            .authorize(self.client.delete(self.document_url(collection, id)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(Self::error_from(response).await),
        }
    }
}

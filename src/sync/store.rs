use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

/// A blob together with the version the store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedBlob {
    pub data: Vec<u8>,
    pub version: u64,
}

/// Failures reported by a cloud blob store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The backend asked us to slow down
    #[error("Rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    /// The record changed since it was read
    #[error("Version conflict: {0}")]
    Conflict(String),
    /// Network trouble, timeouts, 5xx: worth retrying
    #[error("Transient failure: {0}")]
    Transient(String),
    /// The request can never succeed as sent
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

/// A key-value blob store with optimistic concurrency.
pub trait BlobStore {
    /// Fetch a record. `Ok(None)` when it has never been written.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<VersionedBlob>, CloudError>> + Send;

    /// Write a record if its current version is `expected_version`.
    ///
    /// `None` means the record must not exist yet. Returns the new version,
    /// or [`CloudError::Conflict`] when the precondition fails.
    fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<u64, CloudError>> + Send;
}

/// In-process blob store. Failures can be queued up front to drive retry
/// paths; each queued failure is returned by the next `put`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    records: Mutex<HashMap<String, VersionedBlob>>,
    failures: Mutex<VecDeque<CloudError>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `put` fail with `error` instead of writing.
    pub async fn fail_next_put(&self, error: CloudError) {
        self.failures.lock().await.push_back(error);
    }

    /// Number of records currently stored.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedBlob>, CloudError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, CloudError> {
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }

        let mut records = self.records.lock().await;
        let current = records.get(key).map(|b| b.version);
        if current != expected_version {
            return Err(CloudError::Conflict(format!(
                "{key}: expected {expected_version:?}, found {current:?}"
            )));
        }

        let version = current.unwrap_or(0) + 1;
        records.insert(key.to_owned(), VersionedBlob { data, version });
        Ok(version)
    }
}

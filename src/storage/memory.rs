//! In-process staging store

use super::{ObjectInfo, StagingStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    content_type: String,
}

type Buckets = HashMap<String, HashMap<String, StoredObject>>;

/// Staging store kept in memory, for tests and local dry runs
///
/// Clones share the same buckets. [`MemoryStore::set_unavailable`] simulates
/// an outage: every call then fails with [`StorageError::Unavailable`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    buckets: Arc<Mutex<Buckets>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of objects across all buckets
    pub async fn object_count(&self) -> usize {
        self.buckets.lock().await.values().map(HashMap::len).sum()
    }

    fn check_available(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                operation,
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "store is offline"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        self.check_available("bucket_exists")?;
        Ok(self.buckets.lock().await.contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.check_available("make_bucket")?;
        self.buckets
            .lock()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.check_available("put_object")?;
        let mut buckets = self.buckets.lock().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NoSuchBucket {
                bucket: bucket.to_string(),
            })?;
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        self.check_available("get_object")?;
        let buckets = self.buckets.lock().await;
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::NoSuchBucket {
                bucket: bucket.to_string(),
            })?;
        objects
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        self.check_available("stat_object")?;
        let buckets = self.buckets.lock().await;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| ObjectInfo {
                byte_length: o.bytes.len() as u64,
                content_type: Some(o.content_type.clone()),
            })
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

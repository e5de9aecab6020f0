//! Object-store staging area
//!
//! This module handles the staging side of the pipeline:
//! - the [`StagingStore`] contract (idempotent bucket provisioning, overwriting puts)
//! - the deterministic key of each table's [`StagedArtifact`]
//! - the CSV interchange format in [`delimited`]
//! - S3/MinIO and in-process backends

pub mod delimited;
mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::{S3Settings, S3Store};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::BoxError;

/// Object store failures, keeping "not found" apart from connectivity
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },

    #[error("bucket '{bucket}' does not exist")]
    NoSuchBucket { bucket: String },

    #[error("access denied to bucket '{bucket}' during {operation}")]
    AccessDenied {
        bucket: String,
        operation: &'static str,
    },

    #[error("object store unavailable during {operation}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
}

impl StorageError {
    pub fn unavailable(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Unavailable {
            operation,
            source: source.into(),
        }
    }

    /// Only outages are worth retrying unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Size and type of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub byte_length: u64,
    pub content_type: Option<String>,
}

/// Object storage used as the staging area
///
/// Every call is idempotent. `put_object` replaces any existing object at
/// the key in one step, so readers see either the old or the new bytes.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// Create `bucket`; succeeds if it already exists
    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError>;

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError>;
}

/// A table's serialized snapshot in the staging area
///
/// There is exactly one current artifact per table; a new extraction
/// overwrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub bucket: String,
    pub key: String,
    pub byte_length: u64,
    pub content_type: String,
}

impl StagedArtifact {
    /// Deterministic key for `table` under `prefix`, e.g. `/temp/flights.csv`
    pub fn key_for(prefix: &str, table: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("/{}.{}", table, delimited::EXTENSION)
        } else {
            format!("/{}/{}.{}", prefix, table, delimited::EXTENSION)
        }
    }

    /// Artifact description from a successful `stat_object`
    pub fn from_info(bucket: impl Into<String>, key: impl Into<String>, info: ObjectInfo) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            byte_length: info.byte_length,
            content_type: info
                .content_type
                .unwrap_or_else(|| delimited::CONTENT_TYPE.to_string()),
        }
    }
}

impl std::fmt::Display for StagedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_convention() {
        assert_eq!(StagedArtifact::key_for("temp", "flights"), "/temp/flights.csv");
        assert_eq!(StagedArtifact::key_for("/temp/", "seats"), "/temp/seats.csv");
        assert_eq!(StagedArtifact::key_for("", "seats"), "/seats.csv");
    }

    #[test]
    fn test_from_info_defaults_content_type() {
        let artifact = StagedArtifact::from_info(
            "extracted-data",
            "/temp/tickets.csv",
            ObjectInfo {
                byte_length: 12,
                content_type: None,
            },
        );
        assert_eq!(artifact.content_type, "application/csv");
        assert_eq!(artifact.to_string(), "extracted-data/temp/tickets.csv");
    }

    #[test]
    fn test_retryable_only_when_unavailable() {
        let not_found = StorageError::NotFound {
            bucket: "b".to_string(),
            key: "k".to_string(),
        };
        assert!(!not_found.is_retryable());
        assert!(StorageError::unavailable("get", std::io::Error::other("reset")).is_retryable());
    }
}

//! Object storage clients.
//!
//! `ObjectStore` is the seam the orchestrator writes through. Production uses
//! Backblaze B2 (`b2`); development can point at a local directory (`local`).

pub mod b2;
pub mod keys;
pub mod local;

use crate::models::upload::StoredVariant;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage credentials rejected: {0}")]
    Authorization(String),
    #[error("storage backend unreachable: {0}")]
    Unavailable(String),
    #[error("failed to write `{key}`: {reason}")]
    Write { key: String, reason: String },
    #[error("failed to delete `{key}`: {reason}")]
    Delete { key: String, reason: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Establish or refresh the backend session. Cheap when already valid.
    async fn ensure_session(&self) -> StorageResult<()>;

    /// Write `data` under `key` and resolve its retrievable URL.
    async fn put(&self, key: &str, data: Bytes, content_type: &str)
    -> StorageResult<StoredVariant>;

    /// Delete `key`. A key that does not exist is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Short backend name for logs and readiness output.
    fn backend(&self) -> &'static str;

    /// Best-effort delete used for rollback; failures are logged and dropped.
    async fn remove(&self, key: &str) {
        match self.delete(key).await {
            Ok(()) => tracing::debug!(key, backend = self.backend(), "removed object"),
            Err(err) => tracing::warn!(
                key,
                backend = self.backend(),
                error = %err,
                "failed to remove object"
            ),
        }
    }
}

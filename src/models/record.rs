//! Ledger row for a completed upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A completed upload as recorded in SQLite.
///
/// The pipeline itself never reads these rows; they exist so an owner can
/// later delete the whole image set.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadRecord {
    /// Upload identifier embedded in every storage key.
    pub id: Uuid,

    /// Caller identifier (JWT subject) that performed the upload.
    pub owner_id: String,

    pub original_filename: String,

    /// Declared MIME type of the inbound file.
    pub content_type: String,

    pub size_bytes: i64,

    /// `derived` or `fallback`.
    pub processing_path: String,

    /// JSON array of storage keys written for this upload.
    pub storage_keys: String,

    pub created_at: DateTime<Utc>,

    pub is_deleted: bool,
}

impl UploadRecord {
    pub fn keys(&self) -> Vec<String> {
        serde_json::from_str(&self.storage_keys).unwrap_or_default()
    }
}

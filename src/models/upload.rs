//! One inbound file and everything the pipeline hands back for it.

use crate::models::variant::Role;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

/// A single inbound file, owned by the intake endpoint until handed to the
/// orchestrator.
#[derive(Clone)]
pub struct UploadRequest {
    pub data: Bytes,

    /// MIME type declared by the client.
    pub content_type: String,

    /// Client-supplied filename. Never used as a storage key.
    pub filename: String,

    /// Byte length declared for the part.
    pub declared_len: u64,
}

impl UploadRequest {
    pub fn new(data: Bytes, content_type: impl Into<String>, filename: impl Into<String>) -> Self {
        let declared_len = data.len() as u64;
        Self {
            data,
            content_type: content_type.into(),
            filename: filename.into(),
            declared_len,
        }
    }

    /// Lower-cased extension of the client filename, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.filename.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("declared_len", &self.declared_len)
            .finish_non_exhaustive()
    }
}

/// Result of persisting one byte buffer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredVariant {
    /// Key the object was written under.
    pub key: String,

    /// Retrievable URL for the object.
    pub url: String,
}

/// Caller-facing URLs for one upload, keyed by role.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    pub original: String,
    pub thumbnail: String,
    pub medium: String,
    pub large: String,
}

impl UploadResult {
    /// Every role pointing at the same URL.
    pub fn uniform(url: &str) -> Self {
        Self {
            original: url.to_string(),
            thumbnail: url.to_string(),
            medium: url.to_string(),
            large: url.to_string(),
        }
    }

    /// Assemble from a role map. Returns the first uncovered role on failure.
    pub fn from_roles(mut urls: BTreeMap<Role, String>) -> Result<Self, Role> {
        let mut take = |role: Role| urls.remove(&role).ok_or(role);
        Ok(Self {
            original: take(Role::Original)?,
            thumbnail: take(Role::Thumbnail)?,
            medium: take(Role::Medium)?,
            large: take(Role::Large)?,
        })
    }

    pub fn url(&self, role: Role) -> &str {
        match role {
            Role::Original => &self.original,
            Role::Thumbnail => &self.thumbnail,
            Role::Medium => &self.medium,
            Role::Large => &self.large,
        }
    }
}

/// Which branch of the pipeline produced an outcome.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingPath {
    /// Variants were decoded, resized and re-encoded.
    Derived,
    /// The codec cannot read this format; the original bytes were stored once.
    Fallback,
}

impl ProcessingPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingPath::Derived => "derived",
            ProcessingPath::Fallback => "fallback",
        }
    }
}

/// Everything the orchestrator produced for one file.
#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub upload_id: Uuid,
    pub path: ProcessingPath,
    pub result: UploadResult,

    /// Objects physically written, one per distinct encode.
    pub stored: Vec<StoredVariant>,
}

impl UploadOutcome {
    pub fn keys(&self) -> Vec<String> {
        self.stored.iter().map(|s| s.key.clone()).collect()
    }
}

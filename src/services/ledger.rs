//! UploadLedger: SQLite record of completed uploads.
//!
//! The pipeline keeps nothing once it returns. The intake layer records which
//! storage keys each upload produced, and who owns them, so the image set can
//! be deleted later.

use crate::models::{
    record::UploadRecord,
    upload::{UploadOutcome, UploadRequest},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Schema applied by `--migrate` and by tests.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("upload `{0}` not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Clone)]
pub struct UploadLedger {
    pub db: Arc<SqlitePool>,
}

impl UploadLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Run every statement in `SCHEMA`.
    pub async fn migrate(&self) -> LedgerResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    pub async fn record(
        &self,
        owner_id: &str,
        upload: &UploadRequest,
        outcome: &UploadOutcome,
    ) -> LedgerResult<UploadRecord> {
        let keys = serde_json::to_string(&outcome.keys())?;
        let record = sqlx::query_as::<_, UploadRecord>(
            r#"
            INSERT INTO uploads (
                id, owner_id, original_filename, content_type, size_bytes,
                processing_path, storage_keys, created_at, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING id, owner_id, original_filename, content_type, size_bytes,
                      processing_path, storage_keys, created_at, is_deleted
            "#,
        )
        .bind(outcome.upload_id)
        .bind(owner_id)
        .bind(&upload.filename)
        .bind(&upload.content_type)
        .bind(upload.declared_len as i64)
        .bind(outcome.path.as_str())
        .bind(keys)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        Ok(record)
    }

    /// Fetch a live (not deleted) upload.
    pub async fn find(&self, id: Uuid) -> LedgerResult<UploadRecord> {
        sqlx::query_as::<_, UploadRecord>(
            "SELECT id, owner_id, original_filename, content_type, size_bytes,
                    processing_path, storage_keys, created_at, is_deleted
             FROM uploads WHERE id = ? AND is_deleted = 0",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => LedgerError::NotFound(id),
            other => LedgerError::Sqlx(other),
        })
    }

    pub async fn mark_deleted(&self, id: Uuid) -> LedgerResult<()> {
        let result =
            sqlx::query("UPDATE uploads SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
                .bind(id)
                .execute(&*self.db)
                .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    /// Liveness check used by `/readyz`.
    pub async fn ping(&self) -> LedgerResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        debug_assert_eq!(one, 1);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn memory_ledger() -> UploadLedger {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let ledger = UploadLedger::new(Arc::new(pool));
    ledger.migrate().await.unwrap();
    ledger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upload::{ProcessingPath, StoredVariant, UploadResult};
    use bytes::Bytes;

    fn outcome() -> UploadOutcome {
        let upload_id = Uuid::new_v4();
        let stored = vec![
            StoredVariant {
                key: format!("thumbnail/{upload_id}.jpg"),
                url: "t".into(),
            },
            StoredVariant {
                key: format!("medium/{upload_id}.jpg"),
                url: "m".into(),
            },
        ];
        UploadOutcome {
            upload_id,
            path: ProcessingPath::Derived,
            result: UploadResult::uniform("m"),
            stored,
        }
    }

    fn upload() -> UploadRequest {
        UploadRequest::new(Bytes::from_static(b"12345"), "image/jpeg", "kitchen.jpg")
    }

    #[tokio::test]
    async fn records_and_finds_upload() {
        let ledger = memory_ledger().await;
        let outcome = outcome();

        let recorded = ledger.record("user-1", &upload(), &outcome).await.unwrap();
        assert_eq!(recorded.id, outcome.upload_id);
        assert_eq!(recorded.size_bytes, 5);
        assert_eq!(recorded.processing_path, "derived");

        let found = ledger.find(outcome.upload_id).await.unwrap();
        assert_eq!(found.owner_id, "user-1");
        assert_eq!(found.original_filename, "kitchen.jpg");
        assert_eq!(found.keys(), outcome.keys());
        assert!(!found.is_deleted);
    }

    #[tokio::test]
    async fn deleted_uploads_are_hidden() {
        let ledger = memory_ledger().await;
        let outcome = outcome();
        ledger.record("user-1", &upload(), &outcome).await.unwrap();

        ledger.mark_deleted(outcome.upload_id).await.unwrap();
        assert!(matches!(
            ledger.find(outcome.upload_id).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.mark_deleted(outcome.upload_id).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn migrate_is_idempotent_and_ping_works() {
        let ledger = memory_ledger().await;
        assert_eq!(ledger.migrate().await.unwrap(), 2);
        ledger.ping().await.unwrap();
    }
}

//! HTTP handlers for image intake.
//!
//! - `POST /storage/upload`          one multipart field `file`
//! - `POST /storage/upload-multiple` up to `max_files` fields named `files`
//! - `DELETE /storage/{upload_id}`   remove an owner's image set
//!
//! Every file in a request is validated before any of them is processed.

use crate::{
    auth::CallerIdentity,
    config::IntakeLimits,
    errors::{AppError, ErrorKind, IntakeError},
    models::upload::{UploadOutcome, UploadRequest, UploadResult},
    state::AppState,
};
use axum::{
    Json,
    extract::{
        Multipart, Path, State,
        multipart::{Field, MultipartError},
    },
    http::StatusCode,
};
use bytes::BytesMut;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Success body: upload id plus one URL per role.
#[derive(Serialize, Debug)]
pub struct UploadResponse {
    pub id: Uuid,
    #[serde(flatten)]
    pub result: UploadResult,
}

impl From<&UploadOutcome> for UploadResponse {
    fn from(outcome: &UploadOutcome) -> Self {
        Self {
            id: outcome.upload_id,
            result: outcome.result.clone(),
        }
    }
}

/// Per-file failure inside a batch response.
#[derive(Serialize, Debug)]
pub struct FailedUpload {
    pub filename: String,
    pub error: String,
    pub kind: ErrorKind,
    pub status: u16,
    pub retryable: bool,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum BatchItem {
    Stored(UploadResponse),
    Failed(FailedUpload),
}

/// `POST /storage/upload`
pub async fn upload_single(
    State(state): State<AppState>,
    CallerIdentity(owner): CallerIdentity,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut uploads = read_uploads(&mut multipart, "file", 1, &state.limits).await?;
    let upload = uploads
        .pop()
        .ok_or_else(|| AppError::bad_request("no file uploaded"))?;

    let outcome = state.orchestrator.process_detached(upload.clone()).await?;
    record_upload(&state, &owner, &upload, &outcome).await;

    Ok(Json(UploadResponse::from(&outcome)))
}

/// `POST /storage/upload-multiple`
///
/// Files succeed or fail independently; the response is 207 when any failed.
/// A rejected storage session fails the whole request.
pub async fn upload_multiple(
    State(state): State<AppState>,
    CallerIdentity(owner): CallerIdentity,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<BatchItem>>), AppError> {
    let uploads =
        read_uploads(&mut multipart, "files", state.limits.max_files, &state.limits).await?;
    if uploads.is_empty() {
        return Err(AppError::bad_request("no files uploaded"));
    }

    let results = state.orchestrator.process_many(uploads.clone()).await;

    let auth_failure = results.iter().find_map(|result| match result {
        Err(IntakeError::Authorization(reason)) => Some(reason.clone()),
        _ => None,
    });
    if let Some(reason) = auth_failure {
        for outcome in results.iter().flatten() {
            state.orchestrator.remove_image_set(&outcome.keys()).await;
        }
        return Err(IntakeError::Authorization(reason).into());
    }

    let mut all_stored = true;
    let mut items = Vec::with_capacity(results.len());
    for (upload, result) in uploads.iter().zip(results) {
        match result {
            Ok(outcome) => {
                record_upload(&state, &owner, upload, &outcome).await;
                items.push(BatchItem::Stored(UploadResponse::from(&outcome)));
            }
            Err(err) => {
                all_stored = false;
                items.push(BatchItem::Failed(FailedUpload {
                    filename: upload.filename.clone(),
                    error: err.to_string(),
                    kind: err.kind(),
                    status: err.status().as_u16(),
                    retryable: err.retryable(),
                }));
            }
        }
    }

    let status = if all_stored {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(items)))
}

/// `DELETE /storage/{upload_id}`
pub async fn delete_upload(
    State(state): State<AppState>,
    CallerIdentity(owner): CallerIdentity,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = Uuid::parse_str(&upload_id)
        .map_err(|_| AppError::not_found(format!("upload `{upload_id}` not found")))?;

    let record = state.ledger.find(id).await?;
    if record.owner_id != owner {
        return Err(AppError::forbidden("upload belongs to another user"));
    }

    state.orchestrator.remove_image_set(&record.keys()).await;
    state.ledger.mark_deleted(id).await?;
    info!(upload_id = %id, owner = %owner, "image set deleted");

    Ok(StatusCode::NO_CONTENT)
}

/// Collect and validate every `field_name` part. Other fields are skipped.
async fn read_uploads(
    multipart: &mut Multipart,
    field_name: &str,
    max_files: usize,
    limits: &IntakeLimits,
) -> Result<Vec<UploadRequest>, AppError> {
    let mut uploads = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(field_name) {
            continue;
        }
        if uploads.len() == max_files {
            return Err(AppError::bad_request(format!(
                "too many files: at most {max_files} per request"
            )));
        }
        uploads.push(read_upload(field, limits).await?);
    }

    Ok(uploads)
}

async fn read_upload(
    mut field: Field<'_>,
    limits: &IntakeLimits,
) -> Result<UploadRequest, AppError> {
    let filename = field.file_name().unwrap_or("upload").to_string();
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    if !content_type.to_ascii_lowercase().starts_with("image/") {
        return Err(AppError::validation(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("file `{filename}` is not an image ({content_type})"),
        ));
    }

    let mut buf = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if (buf.len() + chunk.len()) as u64 > limits.max_upload_bytes {
            return Err(AppError::validation(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "file `{filename}` is larger than {} bytes",
                    limits.max_upload_bytes
                ),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    if buf.is_empty() {
        return Err(AppError::bad_request(format!("file `{filename}` is empty")));
    }

    Ok(UploadRequest::new(buf.freeze(), content_type, filename))
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::validation(err.status(), err.body_text())
}

/// Ledger failures do not undo a stored upload; the image set just cannot be
/// deleted through the API later.
async fn record_upload(
    state: &AppState,
    owner: &str,
    upload: &UploadRequest,
    outcome: &UploadOutcome,
) {
    if let Err(err) = state.ledger.record(owner, upload, outcome).await {
        warn!(
            upload_id = %outcome.upload_id,
            error = %err,
            "could not record upload in ledger"
        );
    }
}

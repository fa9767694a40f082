//! Routes for image intake.
//!
//! - `GET    /healthz`, `GET /readyz`: health checks, no auth
//! - `POST   /storage/upload`: one image, field `file`
//! - `POST   /storage/upload-multiple`: several images, fields `files`
//! - `DELETE /storage/{upload_id}`: remove an image set
//! - `GET    /files/{*key}`: objects written by the local backend
//!
//! The wildcard `*key` covers role-prefixed keys like `medium/{id}.webp`.

use crate::{
    config::IntakeLimits,
    handlers::{
        file_handlers::get_file,
        health_handlers::{healthz, readyz},
        upload_handlers::{delete_upload, upload_multiple, upload_single},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router. Bearer auth is enforced per handler by `CallerIdentity`.
pub fn routes(limits: &IntakeLimits) -> Router<AppState> {
    let storage = Router::new()
        .route("/storage/upload", post(upload_single))
        .route("/storage/upload-multiple", post(upload_multiple))
        .route("/storage/{upload_id}", delete(delete_upload))
        .layer(DefaultBodyLimit::max(limits.body_limit()));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files/{*key}", get(get_file))
        .merge(storage)
}

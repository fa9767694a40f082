//! Serves objects written by the local backend. With B2 the URLs point at the
//! bucket or CDN and this route always answers 404.

use crate::{errors::AppError, state::AppState, storage::StorageError};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// `GET /files/{*key}`
pub async fn get_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let local = state
        .local
        .as_ref()
        .ok_or_else(|| AppError::not_found("file serving is disabled"))?;

    let file = match local.open(&key).await {
        Ok(Some(file)) => file,
        Ok(None) | Err(StorageError::InvalidKey(_)) => {
            return Err(AppError::not_found(format!("no object at `{key}`")));
        }
        Err(err) => return Err(AppError::internal(err.to_string())),
    };
    let len = file.metadata().await.ok().map(|m| m.len());

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&key)),
    );
    if let Some(len) = len {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    Ok(response)
}

fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::content_type_for;
    use crate::{
        storage::{ObjectStore, local::LocalStore},
        test_support::{MemoryStore, test_router, test_router_with},
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("medium/a.jpg"), "image/jpeg");
        assert_eq!(content_type_for("original/a.HEIC"), "image/heic");
        assert_eq!(content_type_for("original/a.bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn serves_locally_stored_objects() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalStore::new(dir.path(), "http://localhost/files"));
        local
            .put("medium/abc.jpg", Bytes::from_static(b"jpeg-bytes"), "image/jpeg")
            .await
            .unwrap();
        let app = test_router_with(local.clone(), Some(local)).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/files/medium/abc.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"jpeg-bytes");

        let missing = app
            .oneshot(
                Request::builder()
                    .uri("/files/medium/missing.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disabled_without_local_backend() {
        let (app, _) = test_router(MemoryStore::new()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/files/medium/abc.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

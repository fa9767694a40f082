//! Backblaze B2 client over the native v2 API.
//!
//! One account session is shared by every concurrent write. Refreshing it is
//! single-flight: callers that find the session missing, stale, or rejected
//! queue on `refresh_gate`, and only the first one re-authorizes.

use super::{ObjectStore, StorageError, StorageResult};
use crate::models::upload::StoredVariant;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::{StatusCode, header};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_API_URL: &str = "https://api.backblazeb2.com";

/// B2 account tokens last 24 hours; refresh a little earlier.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(23 * 60 * 60);

#[derive(Clone)]
pub struct B2Config {
    pub key_id: String,
    pub application_key: String,
    pub bucket_id: String,
    pub bucket_name: String,

    /// Base for the authorize call. Overridable for tests and regions.
    pub api_url: String,

    /// CDN base that replaces the native download URL, e.g. a Cloudflare host.
    pub public_base_url: Option<String>,

    pub session_ttl: Duration,
}

impl fmt::Debug for B2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("B2Config")
            .field("key_id", &redact(&self.key_id))
            .field("application_key", &"***")
            .field("bucket_id", &self.bucket_id)
            .field("bucket_name", &self.bucket_name)
            .field("api_url", &self.api_url)
            .field("public_base_url", &self.public_base_url)
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

fn redact(value: &str) -> String {
    let visible: String = value.chars().take(8).collect();
    format!("{visible}...")
}

/// Authorization state for the account.
#[derive(Debug)]
struct B2Session {
    authorization_token: String,
    api_url: String,
    download_url: String,
    issued_at: Instant,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    authorization_token: String,
    api_url: String,
    download_url: String,
}

/// One-time write target from `b2_get_upload_url`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

#[derive(Deserialize)]
struct ListFileVersionsResponse {
    files: Vec<FileVersion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileVersion {
    file_id: String,
    file_name: String,
}

#[derive(Deserialize, Default)]
struct B2ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Failure of one B2 call before it is given key context.
#[derive(Debug)]
enum CallError {
    Session(StorageError),
    /// Account or upload token no longer accepted.
    Expired,
    Rejected(String),
}

impl CallError {
    fn into_storage(self, key: &str, write: bool) -> StorageError {
        match self {
            CallError::Session(err) => err,
            CallError::Expired => {
                StorageError::Authorization("token rejected right after refresh".into())
            }
            CallError::Rejected(reason) if write => StorageError::Write {
                key: key.to_string(),
                reason,
            },
            CallError::Rejected(reason) => StorageError::Delete {
                key: key.to_string(),
                reason,
            },
        }
    }
}

pub struct B2Store {
    http: reqwest::Client,
    config: B2Config,
    session: RwLock<Option<Arc<B2Session>>>,
    refresh_gate: Mutex<()>,
}

impl B2Store {
    pub fn new(config: B2Config) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: B2Config) -> Self {
        Self {
            http,
            config,
            session: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Current session if it exists and is younger than the TTL.
    async fn current(&self) -> Option<Arc<B2Session>> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|s| s.issued_at.elapsed() < self.config.session_ttl)
            .cloned()
    }

    async fn session(&self) -> StorageResult<Arc<B2Session>> {
        if let Some(session) = self.current().await {
            return Ok(session);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(session) = self.current().await {
            return Ok(session);
        }

        let fresh = Arc::new(self.authorize().await?);
        *self.session.write().await = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Drop `stale` unless someone already replaced it.
    async fn invalidate(&self, stale: &Arc<B2Session>) {
        let mut guard = self.session.write().await;
        if guard.as_ref().is_some_and(|s| Arc::ptr_eq(s, stale)) {
            *guard = None;
        }
    }

    async fn authorize(&self) -> StorageResult<B2Session> {
        info!(
            key_id = %redact(&self.config.key_id),
            bucket_id = %self.config.bucket_id,
            "authorizing with Backblaze B2"
        );

        let credentials = general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.key_id, self.config.application_key
        ));
        let url = format!(
            "{}/b2api/v2/b2_authorize_account",
            self.config.api_url.trim_end_matches('/')
        );

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, format!("Basic {credentials}"))
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            let body = error_body(response).await;
            warn!(code = %body.code, "B2 rejected account credentials");
            return Err(StorageError::Authorization(format!(
                "{}: {}",
                body.code, body.message
            )));
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(StorageError::Unavailable(format!(
                "authorize returned {status}: {}",
                body.message
            )));
        }

        let parsed: AuthorizeAccountResponse = response
            .json()
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        info!("authorized with Backblaze B2");

        Ok(B2Session {
            authorization_token: parsed.authorization_token,
            api_url: parsed.api_url,
            download_url: parsed.download_url,
            issued_at: Instant::now(),
        })
    }

    /// POST to an account-scoped API endpoint, refreshing the session once if
    /// the token has lapsed.
    async fn call_api<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> Result<(Arc<B2Session>, T), CallError> {
        let mut refreshed = false;
        loop {
            let session = self.session().await.map_err(CallError::Session)?;
            let url = format!(
                "{}/b2api/v2/{}",
                session.api_url.trim_end_matches('/'),
                endpoint
            );
            let response = self
                .http
                .post(&url)
                .header(header::AUTHORIZATION, &session.authorization_token)
                .json(body)
                .send()
                .await
                .map_err(|err| CallError::Rejected(err.to_string()))?;

            match check(response).await {
                Ok(response) => {
                    let parsed = response
                        .json::<T>()
                        .await
                        .map_err(|err| CallError::Rejected(err.to_string()))?;
                    return Ok((session, parsed));
                }
                Err(CallError::Expired) if !refreshed => {
                    debug!(endpoint, "B2 session lapsed; re-authorizing");
                    self.invalidate(&session).await;
                    refreshed = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn upload(
        &self,
        target: &UploadTarget,
        key: &str,
        data: &Bytes,
        content_type: &str,
    ) -> Result<(), CallError> {
        let response = self
            .http
            .post(&target.upload_url)
            .header(header::AUTHORIZATION, &target.authorization_token)
            .header("X-Bz-File-Name", key)
            .header(header::CONTENT_TYPE, content_type)
            .header("X-Bz-Content-Sha1", "do_not_verify")
            .body(data.clone())
            .send()
            .await
            .map_err(|err| CallError::Rejected(err.to_string()))?;

        match response.status() {
            // B2 asks clients to fetch a fresh upload URL for these.
            StatusCode::UNAUTHORIZED
            | StatusCode::REQUEST_TIMEOUT
            | StatusCode::SERVICE_UNAVAILABLE => Err(CallError::Expired),
            _ => check(response).await.map(|_| ()),
        }
    }

    fn url_for(&self, session: &B2Session, key: &str) -> String {
        match self.config.public_base_url.as_deref() {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!(
                "{}/file/{}/{}",
                session.download_url.trim_end_matches('/'),
                self.config.bucket_name,
                key
            ),
        }
    }
}

/// Map a B2 response to success, a lapsed token, or a rejection.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = error_body(response).await;
    if status == StatusCode::UNAUTHORIZED
        && matches!(body.code.as_str(), "expired_auth_token" | "bad_auth_token")
    {
        return Err(CallError::Expired);
    }
    Err(CallError::Rejected(format!(
        "{status} {}: {}",
        body.code, body.message
    )))
}

async fn error_body(response: reqwest::Response) -> B2ErrorBody {
    response.json().await.unwrap_or_default()
}

#[async_trait]
impl ObjectStore for B2Store {
    async fn ensure_session(&self) -> StorageResult<()> {
        self.session().await.map(|_| ())
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<StoredVariant> {
        let request = json!({ "bucketId": self.config.bucket_id });
        let mut retried = false;
        loop {
            let (session, target) = self
                .call_api::<UploadTarget>("b2_get_upload_url", &request)
                .await
                .map_err(|err| err.into_storage(key, true))?;

            match self.upload(&target, key, &data, content_type).await {
                Ok(()) => {
                    debug!(key, bytes = data.len(), "uploaded object to B2");
                    return Ok(StoredVariant {
                        key: key.to_string(),
                        url: self.url_for(&session, key),
                    });
                }
                Err(CallError::Expired) if !retried => {
                    debug!(key, "upload target expired; requesting a new one");
                    retried = true;
                }
                Err(CallError::Expired) => {
                    return Err(StorageError::Write {
                        key: key.to_string(),
                        reason: "upload target rejected twice".into(),
                    });
                }
                Err(err) => return Err(err.into_storage(key, true)),
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let (_, listing) = self
            .call_api::<ListFileVersionsResponse>(
                "b2_list_file_versions",
                &json!({
                    "bucketId": self.config.bucket_id,
                    "startFileName": key,
                    "prefix": key,
                    "maxFileCount": 100,
                }),
            )
            .await
            .map_err(|err| err.into_storage(key, false))?;

        for version in listing.files.iter().filter(|f| f.file_name == key) {
            self.call_api::<Value>(
                "b2_delete_file_version",
                &json!({ "fileName": version.file_name, "fileId": version.file_id }),
            )
            .await
            .map_err(|err| err.into_storage(key, false))?;
            debug!(key, file_id = %version.file_id, "deleted B2 file version");
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "b2"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const AUTHORIZE: &str = "/b2api/v2/b2_authorize_account";
    const GET_UPLOAD_URL: &str = "/b2api/v2/b2_get_upload_url";

    fn config(server: &ServerGuard, cdn: Option<&str>) -> B2Config {
        B2Config {
            key_id: "key-id".into(),
            application_key: "secret".into(),
            bucket_id: "bucket-id".into(),
            bucket_name: "listings".into(),
            api_url: server.url(),
            public_base_url: cdn.map(str::to_string),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    fn authorize_body(server: &ServerGuard, token: &str) -> String {
        json!({
            "accountId": "acct",
            "authorizationToken": token,
            "apiUrl": server.url(),
            "downloadUrl": format!("{}/dl", server.url()),
        })
        .to_string()
    }

    fn upload_target_body(server: &ServerGuard) -> String {
        json!({
            "bucketId": "bucket-id",
            "uploadUrl": format!("{}/upload/bucket-id", server.url()),
            "authorizationToken": "upload-token",
        })
        .to_string()
    }

    #[tokio::test]
    async fn concurrent_puts_share_one_authorization() {
        let mut server = Server::new_async().await;
        let basic = format!(
            "Basic {}",
            general_purpose::STANDARD.encode("key-id:secret")
        );
        let authorize = server
            .mock("GET", AUTHORIZE)
            .match_header("authorization", basic.as_str())
            .with_status(200)
            .with_body(authorize_body(&server, "acct-token"))
            .expect(1)
            .create_async()
            .await;
        let get_upload_url = server
            .mock("POST", GET_UPLOAD_URL)
            .match_header("authorization", "acct-token")
            .match_body(Matcher::Json(json!({ "bucketId": "bucket-id" })))
            .with_status(200)
            .with_body(upload_target_body(&server))
            .expect(2)
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/upload/bucket-id")
            .match_header("authorization", "upload-token")
            .match_header("content-type", "image/jpeg")
            .match_header("x-bz-file-name", Matcher::Regex("^(thumbnail|medium)/a\\.jpg$".into()))
            .with_status(200)
            .with_body(r#"{"fileId":"f"}"#)
            .expect(2)
            .create_async()
            .await;

        let store = B2Store::new(config(&server, Some("https://cdn.example.com/")));
        let (thumb, medium) = tokio::join!(
            store.put("thumbnail/a.jpg", Bytes::from_static(b"t"), "image/jpeg"),
            store.put("medium/a.jpg", Bytes::from_static(b"m"), "image/jpeg"),
        );

        assert_eq!(thumb.unwrap().url, "https://cdn.example.com/thumbnail/a.jpg");
        assert_eq!(medium.unwrap().url, "https://cdn.example.com/medium/a.jpg");
        authorize.assert_async().await;
        get_upload_url.assert_async().await;
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn url_uses_native_download_host_without_cdn() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", AUTHORIZE)
            .with_status(200)
            .with_body(authorize_body(&server, "acct-token"))
            .create_async()
            .await;
        server
            .mock("POST", GET_UPLOAD_URL)
            .with_status(200)
            .with_body(upload_target_body(&server))
            .create_async()
            .await;
        server
            .mock("POST", "/upload/bucket-id")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let store = B2Store::new(config(&server, None));
        let stored = store
            .put("original/a.heic", Bytes::from_static(b"h"), "image/heic")
            .await
            .unwrap();
        assert_eq!(
            stored.url,
            format!("{}/dl/file/listings/original/a.heic", server.url())
        );
    }

    #[tokio::test]
    async fn rejected_credentials_abort_before_any_write() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", AUTHORIZE)
            .with_status(401)
            .with_body(r#"{"status":401,"code":"unauthorized","message":"bad key"}"#)
            .create_async()
            .await;
        let get_upload_url = server
            .mock("POST", GET_UPLOAD_URL)
            .expect(0)
            .create_async()
            .await;

        let store = B2Store::new(config(&server, None));
        let err = store
            .put("medium/a.jpg", Bytes::from_static(b"m"), "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Authorization(_)), "{err:?}");
        assert!(matches!(
            store.ensure_session().await,
            Err(StorageError::Authorization(_))
        ));
        get_upload_url.assert_async().await;
    }

    #[tokio::test]
    async fn expired_account_token_triggers_one_reauthorization() {
        let mut server = Server::new_async().await;
        let issued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&issued);
        let api_url = server.url();
        let authorize = server
            .mock("GET", AUTHORIZE)
            .with_status(200)
            .with_body_from_request(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                json!({
                    "authorizationToken": format!("token-{n}"),
                    "apiUrl": api_url,
                    "downloadUrl": api_url,
                })
                .to_string()
                .into_bytes()
            })
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", GET_UPLOAD_URL)
            .match_header("authorization", "token-1")
            .with_status(401)
            .with_body(r#"{"status":401,"code":"expired_auth_token","message":"expired"}"#)
            .create_async()
            .await;
        server
            .mock("POST", GET_UPLOAD_URL)
            .match_header("authorization", "token-2")
            .with_status(200)
            .with_body(upload_target_body(&server))
            .create_async()
            .await;
        server
            .mock("POST", "/upload/bucket-id")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let store = B2Store::new(config(&server, Some("https://cdn.example.com")));
        store
            .put("medium/a.jpg", Bytes::from_static(b"m"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(issued.load(Ordering::SeqCst), 2);
        authorize.assert_async().await;
    }

    #[tokio::test]
    async fn stale_session_is_refreshed_after_ttl() {
        let mut server = Server::new_async().await;
        let authorize = server
            .mock("GET", AUTHORIZE)
            .with_status(200)
            .with_body(authorize_body(&server, "acct-token"))
            .expect(2)
            .create_async()
            .await;

        let mut cfg = config(&server, None);
        cfg.session_ttl = Duration::ZERO;
        let store = B2Store::new(cfg);
        store.ensure_session().await.unwrap();
        store.ensure_session().await.unwrap();
        authorize.assert_async().await;
    }

    #[tokio::test]
    async fn backend_rejection_is_a_write_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", AUTHORIZE)
            .with_status(200)
            .with_body(authorize_body(&server, "acct-token"))
            .create_async()
            .await;
        server
            .mock("POST", GET_UPLOAD_URL)
            .with_status(200)
            .with_body(upload_target_body(&server))
            .create_async()
            .await;
        server
            .mock("POST", "/upload/bucket-id")
            .with_status(400)
            .with_body(r#"{"status":400,"code":"bad_request","message":"nope"}"#)
            .create_async()
            .await;

        let store = B2Store::new(config(&server, None));
        let err = store
            .put("medium/a.jpg", Bytes::from_static(b"m"), "image/jpeg")
            .await
            .unwrap_err();
        match err {
            StorageError::Write { key, reason } => {
                assert_eq!(key, "medium/a.jpg");
                assert!(reason.contains("bad_request"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_removes_only_exact_name_versions() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", AUTHORIZE)
            .with_status(200)
            .with_body(authorize_body(&server, "acct-token"))
            .create_async()
            .await;
        server
            .mock("POST", "/b2api/v2/b2_list_file_versions")
            .match_body(Matcher::PartialJson(json!({ "startFileName": "medium/a.jpg" })))
            .with_status(200)
            .with_body(
                json!({
                    "files": [
                        { "fileId": "v1", "fileName": "medium/a.jpg" },
                        { "fileId": "v2", "fileName": "medium/a.jpg.bak" },
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;
        let delete_version = server
            .mock("POST", "/b2api/v2/b2_delete_file_version")
            .match_body(Matcher::Json(
                json!({ "fileName": "medium/a.jpg", "fileId": "v1" }),
            ))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let store = B2Store::new(config(&server, None));
        store.delete("medium/a.jpg").await.unwrap();
        delete_version.assert_async().await;
    }
}

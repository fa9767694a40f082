//! Shared helpers for unit tests: generated images and an in-memory store.

use crate::{
    auth::TokenVerifier,
    config::IntakeLimits,
    models::upload::StoredVariant,
    routes::routes::routes,
    services::{
        codec::ImageCodec, ledger::memory_ledger, orchestrator::UploadOrchestrator,
        planner::DerivationPlanner,
    },
    state::AppState,
    storage::{ObjectStore, StorageError, StorageResult, local::LocalStore},
};
use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{
    collections::BTreeMap,
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

pub const MEMORY_BASE_URL: &str = "https://cdn.test";
pub const TEST_SECRET: &str = "test-secret";

/// Small ceilings so limit checks are cheap to hit.
pub const TEST_LIMITS: IntakeLimits = IntakeLimits {
    max_upload_bytes: 512 * 1024,
    max_files: 3,
};

pub async fn test_state(
    store: Arc<dyn ObjectStore>,
    local: Option<Arc<LocalStore>>,
) -> AppState {
    let orchestrator =
        UploadOrchestrator::new(DerivationPlanner::default(), ImageCodec::default(), store, 2);
    AppState {
        orchestrator: Arc::new(orchestrator),
        ledger: memory_ledger().await,
        verifier: Arc::new(TokenVerifier::new(TEST_SECRET)),
        limits: TEST_LIMITS,
        local,
    }
}

pub async fn test_router_with(
    store: Arc<dyn ObjectStore>,
    local: Option<Arc<LocalStore>>,
) -> Router {
    let state = test_state(store, local).await;
    routes(&state.limits).with_state(state)
}

/// Router over a `MemoryStore`, plus the state it was built from.
pub async fn test_router(store: MemoryStore) -> (Router, AppState) {
    let state = test_state(Arc::new(store), None).await;
    (routes(&state.limits).with_state(state.clone()), state)
}

/// A gradient JPEG so encoders have real content to work with.
pub fn jpeg_bytes(width: u32, height: u32) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
        .expect("encode test jpeg");
    Bytes::from(buffer)
}

#[derive(Default)]
struct Inner {
    objects: Mutex<BTreeMap<String, (Bytes, String)>>,
    puts: AtomicUsize,
    sessions: AtomicUsize,
    reject_sessions: AtomicBool,
    fail_puts_containing: Mutex<Option<String>>,
    deletes: AtomicUsize,
    fail_deletes_containing: Mutex<Option<String>>,
    put_delay: Mutex<Duration>,
}

/// `ObjectStore` backed by a map, with failure injection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every put whose key contains `pattern` fails with a write error.
    pub fn failing_puts(self, pattern: &str) -> Self {
        *self.inner.fail_puts_containing.lock().unwrap() = Some(pattern.to_string());
        self
    }

    /// Every delete whose key contains `pattern` fails and leaves the object.
    pub fn failing_deletes(self, pattern: &str) -> Self {
        *self.inner.fail_deletes_containing.lock().unwrap() = Some(pattern.to_string());
        self
    }

    pub fn rejecting_sessions(self) -> Self {
        self.inner.reject_sessions.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_put_delay(self, delay: Duration) -> Self {
        *self.inner.put_delay.lock().unwrap() = delay;
        self
    }

    /// Completed put attempts, successful or not.
    pub fn put_count(&self) -> usize {
        self.inner.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        let objects = self.inner.objects.lock().unwrap();
        objects.get(key).map(|(data, _)| data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        let objects = self.inner.objects.lock().unwrap();
        objects.get(key).map(|(_, content_type)| content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_session(&self) -> StorageResult<()> {
        self.inner.sessions.fetch_add(1, Ordering::SeqCst);
        if self.inner.reject_sessions.load(Ordering::SeqCst) {
            return Err(StorageError::Authorization("test credentials rejected".into()));
        }
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<StoredVariant> {
        let delay = *self.inner.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .inner
            .fail_puts_containing
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|pattern| key.contains(pattern));

        let mut objects = self.inner.objects.lock().unwrap();
        self.inner.puts.fetch_add(1, Ordering::SeqCst);
        if failing {
            return Err(StorageError::Write {
                key: key.to_string(),
                reason: "injected failure".into(),
            });
        }
        objects.insert(key.to_string(), (data, content_type.to_string()));

        Ok(StoredVariant {
            key: key.to_string(),
            url: format!("{MEMORY_BASE_URL}/{key}"),
        })
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.deletes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .inner
            .fail_deletes_containing
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|pattern| key.contains(pattern));
        if failing {
            return Err(StorageError::Delete {
                key: key.to_string(),
                reason: "injected failure".into(),
            });
        }

        self.inner.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

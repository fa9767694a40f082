//! Upload orchestrator: coordinates planner, codec and object store.
//!
//! Per file: `Received → Classified → {FallbackStore | Deriving} → Storing →
//! Complete | Failed`. A file either gets a URL for every role or nothing:
//! if any write fails the variants already written are removed.

use crate::{
    errors::IntakeError,
    models::{
        upload::{ProcessingPath, StoredVariant, UploadOutcome, UploadRequest, UploadResult},
        variant::{Role, VariantSpec},
    },
    services::{
        codec::{DerivedImage, FormatSupport, ImageCodec},
        planner::DerivationPlanner,
    },
    storage::{ObjectStore, StorageError, keys},
};
use futures::future::join_all;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Semaphore, oneshot};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

pub struct UploadOrchestrator {
    planner: DerivationPlanner,
    codec: ImageCodec,
    store: Arc<dyn ObjectStore>,

    /// Bounds CPU-bound derivations across all in-flight uploads.
    derivations: Arc<Semaphore>,
}

impl UploadOrchestrator {
    pub fn new(
        planner: DerivationPlanner,
        codec: ImageCodec,
        store: Arc<dyn ObjectStore>,
        max_concurrent_derivations: usize,
    ) -> Self {
        Self {
            planner,
            codec,
            store,
            derivations: Arc::new(Semaphore::new(max_concurrent_derivations.max(1))),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Process one file. No retries; callers re-invoke on failure.
    pub async fn process(&self, upload: UploadRequest) -> Result<UploadOutcome, IntakeError> {
        let upload_id = Uuid::new_v4();
        let span = info_span!(
            "upload",
            %upload_id,
            filename = %upload.filename,
            content_type = %upload.content_type,
        );
        self.run(upload_id, upload).instrument(span).await
    }

    /// Process one file on its own task.
    ///
    /// If the caller stops waiting, writes already in flight finish and are
    /// then removed instead of being left unreferenced.
    pub async fn process_detached(
        self: &Arc<Self>,
        upload: UploadRequest,
    ) -> Result<UploadOutcome, IntakeError> {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.process(upload).await;
            if let Err(Ok(orphaned)) = tx.send(result) {
                warn!(
                    upload_id = %orphaned.upload_id,
                    objects = orphaned.stored.len(),
                    "caller went away; rolling back stored upload"
                );
                this.rollback(&orphaned.stored).await;
            }
        });

        rx.await
            .map_err(|_| IntakeError::Processing("upload task ended without a result".into()))?
    }

    /// Process files independently. Results follow input order.
    pub async fn process_many(
        self: &Arc<Self>,
        uploads: Vec<UploadRequest>,
    ) -> Vec<Result<UploadOutcome, IntakeError>> {
        join_all(
            uploads
                .into_iter()
                .map(|upload| self.process_detached(upload)),
        )
        .await
    }

    /// Best-effort removal of every role's object for the given keys.
    pub async fn remove_image_set(&self, stored_keys: &[String]) {
        let all = keys::image_set_keys(stored_keys.iter().map(String::as_str));
        join_all(all.iter().map(|key| self.store.remove(key))).await;
    }

    async fn run(
        &self,
        upload_id: Uuid,
        upload: UploadRequest,
    ) -> Result<UploadOutcome, IntakeError> {
        debug!(state = "received", bytes = upload.declared_len);

        let support = self.codec.classify(&upload.content_type, &upload.filename);
        debug!(state = "classified", ?support);

        let result = match support {
            FormatSupport::Unsupported(format) => {
                self.store_fallback(upload_id, &upload, &format).await
            }
            FormatSupport::Decodable => self.store_derived(upload_id, &upload).await,
        };

        match &result {
            Ok(outcome) => info!(
                state = "complete",
                path = outcome.path.as_str(),
                objects = outcome.stored.len(),
                original = outcome.result.url(Role::Original),
                "upload stored"
            ),
            Err(err) => warn!(
                state = "failed",
                kind = err.kind().as_str(),
                error = %err,
                "upload failed"
            ),
        }
        result
    }

    /// Store the untouched bytes once and publish that URL for every role.
    async fn store_fallback(
        &self,
        upload_id: Uuid,
        upload: &UploadRequest,
        format: &str,
    ) -> Result<UploadOutcome, IntakeError> {
        info!(format, "format not decodable here; storing original as-is");

        let extension =
            keys::passthrough_extension(upload.extension().as_deref(), &upload.content_type);
        let key = keys::object_key(Role::Original, upload_id, &extension);

        self.store.ensure_session().await?;
        debug!(state = "storing", key = %key);
        let stored = self
            .store
            .put(&key, upload.data.clone(), &upload.content_type)
            .await?;

        Ok(UploadOutcome {
            upload_id,
            path: ProcessingPath::Fallback,
            result: UploadResult::uniform(&stored.url),
            stored: vec![stored],
        })
    }

    async fn store_derived(
        &self,
        upload_id: Uuid,
        upload: &UploadRequest,
    ) -> Result<UploadOutcome, IntakeError> {
        let plan = self.planner.plan(upload);
        debug!(
            state = "deriving",
            profile = ?self.planner.profile(),
            variants = plan.variants().len()
        );

        // Every variant is derived before anything is written, so a corrupt
        // input never leaves objects behind.
        let derived = self.derive_all(upload, plan.variants()).await?;

        debug!(state = "storing");
        let writes = plan
            .variants()
            .iter()
            .zip(derived)
            .map(|(spec, image)| self.write_variant(upload_id, spec.role, image));

        let mut stored = Vec::with_capacity(plan.variants().len());
        let mut failure = None;
        for result in join_all(writes).await {
            match result {
                Ok(variant) => stored.push(variant),
                Err(err) if failure.is_none() => failure = Some(err),
                Err(err) => debug!(error = %err, "additional variant write failed"),
            }
        }

        if let Some(err) = failure {
            warn!(
                written = stored.len(),
                error = %err,
                "variant write failed; rolling back"
            );
            self.rollback(&stored).await;
            return Err(err.into());
        }

        let mut urls = BTreeMap::new();
        for (spec, variant) in plan.variants().iter().zip(&stored) {
            urls.insert(spec.role, variant.url.clone());
        }
        for alias in plan.aliases() {
            if let Some(url) = urls.get(&alias.target).cloned() {
                urls.insert(alias.role, url);
            }
        }

        let result = match UploadResult::from_roles(urls) {
            Ok(result) => result,
            Err(role) => {
                self.rollback(&stored).await;
                return Err(IntakeError::Processing(format!(
                    "plan left role `{role}` without a URL"
                )));
            }
        };

        Ok(UploadOutcome {
            upload_id,
            path: ProcessingPath::Derived,
            result,
            stored,
        })
    }

    /// Decode once and render every variant on the blocking pool.
    async fn derive_all(
        &self,
        upload: &UploadRequest,
        specs: &[VariantSpec],
    ) -> Result<Vec<DerivedImage>, IntakeError> {
        let _permit = self
            .derivations
            .acquire()
            .await
            .map_err(|_| IntakeError::Processing("derivation pool closed".into()))?;

        let codec = self.codec;
        let upload = upload.clone();
        let specs = specs.to_vec();
        tokio::task::spawn_blocking(move || match specs.as_slice() {
            [spec] => codec.derive(&upload, spec).map(|image| vec![image]),
            specs => codec.derive_many(&upload, specs),
        })
        .await
        .map_err(|err| IntakeError::Processing(err.to_string()))?
        .map_err(IntakeError::from)
    }

    async fn write_variant(
        &self,
        upload_id: Uuid,
        role: Role,
        image: DerivedImage,
    ) -> Result<StoredVariant, StorageError> {
        let key = keys::object_key(role, upload_id, image.encoding.extension());
        self.store.ensure_session().await?;
        debug!(
            key = %key,
            width = image.width,
            height = image.height,
            bytes = image.data.len(),
            "writing variant"
        );
        self.store
            .put(&key, image.data, image.encoding.content_type())
            .await
    }

    async fn rollback(&self, stored: &[StoredVariant]) {
        join_all(stored.iter().map(|variant| self.store.remove(&variant.key))).await;
    }
}

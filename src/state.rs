use crate::{
    auth::TokenVerifier,
    config::IntakeLimits,
    services::{ledger::UploadLedger, orchestrator::UploadOrchestrator},
    storage::local::LocalStore,
};
use axum::extract::FromRef;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<UploadOrchestrator>,
    pub ledger: UploadLedger,
    pub verifier: Arc<TokenVerifier>,
    pub limits: IntakeLimits,

    /// Set when objects live on local disk and are served by `/files`.
    pub local: Option<Arc<LocalStore>>,
}

impl FromRef<AppState> for Arc<TokenVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

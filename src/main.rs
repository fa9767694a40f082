use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
mod storage;
#[cfg(test)]
mod test_support;

use crate::{
    auth::TokenVerifier,
    config::{AppConfig, StorageBackend},
    services::{
        codec::ImageCodec, ledger::UploadLedger, orchestrator::UploadOrchestrator,
        planner::DerivationPlanner,
    },
    state::AppState,
    storage::{ObjectStore, b2::B2Store, local::LocalStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-intake with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let connect_options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database URL `{}`", cfg.database_url))?
        .create_if_missing(true);
    if let Some(parent) = Path::new(connect_options.get_filename()).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?,
    );
    let ledger = UploadLedger::new(db);

    // --- Schema is idempotent; `--migrate` applies it and exits ---
    let applied = ledger.migrate().await?;
    if migrate {
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(());
    }

    // --- Storage backend ---
    let (store, local) = match &cfg.backend {
        StorageBackend::B2(b2) => {
            let b2: Arc<dyn ObjectStore> = Arc::new(B2Store::new(b2.clone()));
            (b2, None)
        }
        StorageBackend::Local { dir, public_url } => {
            let local = Arc::new(LocalStore::new(dir.clone(), public_url.clone()));
            local.ensure_session().await?;
            tracing::info!("Storing objects under {}", dir.display());
            (local.clone() as Arc<dyn ObjectStore>, Some(local))
        }
    };

    // --- Initialize core services ---
    let orchestrator = UploadOrchestrator::new(
        DerivationPlanner::new(cfg.profile, cfg.quality).with_encoding(cfg.encoding),
        ImageCodec::default(),
        store,
        cfg.max_derivations,
    );
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        ledger,
        verifier: Arc::new(TokenVerifier::new(&cfg.jwt_secret)),
        limits: cfg.limits,
        local,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(&cfg.limits).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

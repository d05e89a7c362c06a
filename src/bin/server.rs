//! agentgate HTTP server binary.
//!
//! Wires storage, the trust engine, the budget ledger, the provider gateway
//! and the coordinator together and serves them over axum.
//!
//! # Environment Variables
//!
//! - `AGENTGATE_CONFIG`: Optional YAML config file
//! - `PORT`: HTTP port (default: 8080)
//! - `AGENTGATE_SQLITE_PATH`: Primary SQLite file (default: data/agentgate.db)
//! - `AGENTGATE_FALLBACK_PATH`: Fallback SQLite file (default: in-memory)
//! - `DATABASE_URL`: PostgreSQL primary, needs the `postgres` feature
//! - `OPENAI_API_KEY` / `OPENAI_BASE_URL`: Enable the OpenAI-compatible provider
//! - `RUST_LOG`: Tracing filter (default: "info,agentgate=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! # or with postgres:
//! DATABASE_URL=postgres://... cargo run --bin server --features postgres
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{error, info, warn};

use agentgate::blackboard::Blackboard;
use agentgate::budget::BudgetLedger;
use agentgate::config::{AppConfig, ProviderConfig, StorageConfig};
use agentgate::coordinator::Coordinator;
use agentgate::observer::{ObserverHub, SnapshotSources};
use agentgate::persistence::{FallbackStore, MemoryBackend, Resync, SqliteBackend, StorageBackend};
use agentgate::provider::{OpenAiCompatibleProvider, ProviderGateway, ScriptedProvider};
use agentgate::server::{app_router, AppState};
use agentgate::trust::TrustEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agentgate=debug".into()),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;

    let store = Arc::new(open_store(&config.storage).await?);
    let blackboard = Arc::new(
        Blackboard::load(store.clone())
            .await
            .context("failed to restore blackboard")?,
    );
    let ledger = Arc::new(
        BudgetLedger::load(store.clone(), config.budget.pricing.clone())
            .await
            .context("failed to restore budget ledger")?,
    );
    // State restored while the primary was down catches up once it returns.
    let resync = store.spawn_resync(vec![
        blackboard.clone() as Arc<dyn Resync>,
        ledger.clone() as Arc<dyn Resync>,
    ]);
    let trust = Arc::new(TrustEngine::new(config.profiles.clone(), store.clone())?);
    let gateway = Arc::new(build_gateway(&config.provider)?);

    let coordinator = Arc::new(Coordinator::new(
        blackboard.clone(),
        ledger.clone(),
        trust.clone(),
        gateway.clone(),
        config.coordinator(),
    ));
    let observer = Arc::new(ObserverHub::spawn(
        SnapshotSources {
            blackboard,
            ledger,
            trust,
            audit_entries: config.observer.audit_entries,
        },
        Duration::from_millis(config.observer.interval_ms),
    ));

    let app = app_router(AppState::new(coordinator, observer.clone(), store.clone()));

    let bind_addr = config.server.bind_addr();
    info!(
        addr = %bind_addr,
        default_provider = gateway.default_provider(),
        providers = ?gateway.provider_names(),
        degraded = store.is_degraded(),
        "agentgate server starting"
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    observer.shutdown();
    resync.abort();
    info!("agentgate server stopped");
    Ok(())
}

async fn open_store(storage: &StorageConfig) -> anyhow::Result<FallbackStore> {
    let fallback: Arc<dyn StorageBackend> = match &storage.fallback_path {
        Some(path) => Arc::new(
            SqliteBackend::open(path)
                .with_context(|| format!("failed to open fallback database {}", path.display()))?,
        ),
        None => Arc::new(MemoryBackend::new("memory")),
    };
    let primary = primary_backend(storage).await?;
    Ok(FallbackStore::connect(primary, fallback, storage.store_options()).await)
}

#[cfg(feature = "postgres")]
async fn primary_backend(storage: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    if let Some(database_url) = &storage.database_url {
        info!("Connecting to PostgreSQL...");
        let backend = agentgate::persistence::PgBackend::connect_lazy(database_url)?;
        match backend.migrate().await {
            Ok(()) => info!("PostgreSQL migrations complete"),
            // The fallback store probes the primary and starts degraded.
            Err(e) => warn!(error = %e, "PostgreSQL migrations failed"),
        }
        return Ok(Arc::new(backend));
    }
    sqlite_primary(storage)
}

#[cfg(not(feature = "postgres"))]
async fn primary_backend(storage: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    if storage.database_url.is_some() {
        warn!("DATABASE_URL is set but the postgres feature is disabled, using SQLite");
    }
    sqlite_primary(storage)
}

fn sqlite_primary(storage: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let backend = SqliteBackend::open(&storage.sqlite_path).with_context(|| {
        format!("failed to open database {}", storage.sqlite_path.display())
    })?;
    Ok(Arc::new(backend))
}

fn build_gateway(config: &ProviderConfig) -> anyhow::Result<ProviderGateway> {
    let mut gateway = ProviderGateway::new(
        config.effective_default(),
        config.retry.clone(),
        config.call_timeout(),
        config.circuit.clone(),
    )
    .register(Arc::new(ScriptedProvider::new("scripted")));

    if config.openai_enabled() {
        let openai = OpenAiCompatibleProvider::new(&config.openai)
            .context("failed to build OpenAI-compatible provider")?;
        gateway = gateway.register(Arc::new(openai));
    } else {
        info!("OPENAI_API_KEY not set, only the scripted provider is available");
    }

    let default = gateway.default_provider().to_string();
    if !gateway.provider_names().contains(&default) {
        bail!("default provider '{default}' is not registered");
    }
    Ok(gateway)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

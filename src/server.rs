/// Server setup and initialization
///
/// Wires together all components: instance store, model registry, connectors,
/// token engine, scheduler and HTTP routes. Recovery of interrupted instances
/// happens here, before the listener accepts requests.

use crate::{
    api::{create_instance_routes, create_model_routes, AppState},
    config::{Config, StorageKind},
    persistence::{InstanceStore, MemoryInstanceStore, PostgresInstanceStore, SqliteInstanceStore},
    runtime::{
        engine::TokenEngine, executor::HttpConnector, instance::InstanceManager, scheduler::InstanceScheduler,
    },
    service::ProcessService,
    workflow::registry::ModelRegistry,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build the service facade and resume interrupted instances
pub async fn create_service(config: &Config) -> Result<ProcessService> {
    let store: Arc<dyn InstanceStore> = match config.database.storage {
        StorageKind::Sqlite => {
            let path = config.database.sqlite_path();
            tracing::info!("🗄️ Using SQLite instance store at {}", path.display());
            Arc::new(
                SqliteInstanceStore::open(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to open instance database: {}", e))?,
            )
        }
        StorageKind::Postgres => Arc::new(
            PostgresInstanceStore::connect(&config.database.postgres)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to Postgres: {}", e))?,
        ),
        StorageKind::Memory => {
            tracing::warn!("⚠️ Using in-memory instance store; instances will not survive a restart");
            Arc::new(MemoryInstanceStore::new())
        }
    };

    tracing::info!("📊 Initializing model registry");
    let models = Arc::new(ModelRegistry::new());
    if let Err(e) = models.load_dir(&config.engine.models_dir) {
        tracing::warn!("⚠️ No models loaded: {}", e);
    }

    tracing::info!("🔌 Configured connectors: {:?}", config.connectors.keys().collect::<Vec<_>>());
    let connector = Arc::new(HttpConnector::new(config.connectors.clone()));
    let engine = Arc::new(TokenEngine::new(connector, config.engine.end_policy));

    let manager = Arc::new(InstanceManager::new(
        engine,
        store,
        &config.system_variables,
        Duration::from_millis(config.engine.step_delay_ms),
    ));
    let scheduler = Arc::new(InstanceScheduler::new(manager));

    scheduler
        .recover(&models)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to recover running instances: {}", e))?;

    Ok(ProcessService::new(models, scheduler))
}

/// HTTP router over an existing service
pub fn create_router(service: ProcessService) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_model_routes())
        .merge(create_instance_routes())
        .with_state(state)
}

/// Create the main Axum application with all routes
pub async fn create_app(config: Config) -> Result<Router> {
    let service = create_service(&config).await?;
    tracing::info!("✅ Application initialized successfully");
    Ok(create_router(service))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting bpmnway server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

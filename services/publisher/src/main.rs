use anyhow::{Context, Result};
use keepsake_publisher::api::start_api_server;
use keepsake_publisher::config::{Config, StorageBackend};
use keepsake_publisher::{
    AppState, ArtifactGenerator, CardEditor, CardRepository, InMemoryCardRepository,
    LifecycleController, LocalObjectStore, ObjectStore, PgCardRepository, PhotoIngestor,
    RetryPolicy, RetryScheduler, S3ObjectStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Keepsake publisher"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = build_object_store(&config).await?;

    let (repository, db_pool) = match config.database.url {
        Some(_) => {
            let repository = PgCardRepository::new(&config.database)
                .await
                .context("Failed to initialize card repository")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                repository
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            let pool = repository.pool().clone();
            let repository: Arc<dyn CardRepository> = Arc::new(repository);
            (repository, Some(pool))
        }
        None => {
            warn!("No database URL configured, cards are kept in memory only");
            let repository: Arc<dyn CardRepository> = Arc::new(InMemoryCardRepository::new());
            (repository, None)
        }
    };

    if config.retry.secret.as_deref().map_or(true, |s| s.trim().is_empty()) {
        warn!("No retry secret configured, /internal/retry-publish will reject every call");
    }

    let generator = Arc::new(ArtifactGenerator::new(
        store.clone(),
        config.ingest.text_panel_max_chars,
    ));
    let controller = Arc::new(LifecycleController::new(
        repository.clone(),
        generator,
        RetryPolicy::from_config(&config.retry),
    ));
    let scheduler = Arc::new(RetryScheduler::new(
        controller.clone(),
        repository.clone(),
        config.retry.clone(),
    ));
    let editor = Arc::new(CardEditor::new(
        repository,
        store.clone(),
        PhotoIngestor::new(config.ingest.clone()),
    ));

    let api_state = AppState {
        editor,
        controller,
        scheduler,
        store,
        db_pool,
    };

    info!("Publisher started successfully");

    if let Err(e) = start_api_server(api_state, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("Publisher stopped");

    Ok(())
}

async fn build_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::Local => {
            let public_base_url = storage
                .public_base_url
                .clone()
                .unwrap_or_else(|| format!("file://{}", storage.local_root));
            let store = LocalObjectStore::new(&storage.local_root, public_base_url)
                .await
                .context("Failed to initialize local object store")?;
            Ok(Arc::new(store))
        }
        StorageBackend::S3 => {
            let s3 = storage
                .s3
                .as_ref()
                .context("storage.backend is s3 but no storage.s3 section is configured")?;
            let store = S3ObjectStore::new(s3, storage.public_base_url.clone())
                .await
                .context("Failed to initialize S3 object store")?;
            Ok(Arc::new(store))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

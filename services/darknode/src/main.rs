use anyhow::{Context, Result};
use darknode::config::{DarknodeConfig, LoggingConfig};
use darknode::{api, AppState, AssetStager, Orchestrator, OrchestratorSettings, ProcessPool, ResourceStore};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = DarknodeConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = init_logging(&config.logging)?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting DarkNode detection service"
    );

    // Initialize metrics
    if config.server.metrics_port != 0 {
        init_metrics(config.server.metrics_port)?;
    }

    // Scratch store; directories left over from a previous run are
    // rescheduled or removed before accepting requests
    let store = ResourceStore::from_config(&config.store);
    let report = store
        .start()
        .await
        .context("Failed to start resource store")?;

    for failure in &report.failures {
        warn!(error = %failure, "Recovery left an entry behind");
    }
    info!(
        root = %store.root().display(),
        scheduled = report.scheduled,
        removed = report.removed,
        skipped = report.skipped,
        "Resource store recovered"
    );

    let stager = AssetStager::new(store.clone(), &config.staging)
        .context("Failed to initialize asset stager")?;

    let pool = Arc::new(ProcessPool::new(config.pool.clone(), config.encoder.clone()));

    let orchestrator = Orchestrator::new(stager, pool, OrchestratorSettings::from(&config));
    let state = AppState::new(orchestrator, config.auth.clone());

    api::serve(state, &config.server, shutdown_signal()).await?;

    info!("Shutting down DarkNode");
    store.shutdown();
    info!("DarkNode stopped");

    Ok(())
}

/// Initialize logging.
///
/// With `logging.directory` set, events are also written as JSON to a file
/// rotated daily, keeping at most `logging.max_files` files.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("darknode={}", level).parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("hyper=warn".parse()?);

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(config.file_prefix.clone())
                .max_log_files(config.max_files)
                .build(directory)
                .with_context(|| format!("Failed to open log directory {}", directory.display()))?;

            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(file_layer);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(guard)
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
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

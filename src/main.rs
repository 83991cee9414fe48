use anyhow::{Context, Result};
use gdash_worker::broker::BrokerConnector;
use gdash_worker::config::WorkerConfig;
use gdash_worker::store::MongoSink;
use gdash_worker::supervisor::{Pipeline, PipelineState};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = WorkerConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        queue = %config.broker.queue,
        "Starting worker"
    );

    // STARTING: acquire everything; any failure here (past the broker retry
    // policy) is fatal and exits non-zero before a single message is pulled.
    info!(state = %PipelineState::Starting, "Acquiring connections");

    let broker = BrokerConnector::connect(&config.broker)
        .await
        .context("Failed to connect to broker")?;

    broker
        .declare_queue(&config.broker.queue)
        .await
        .context("Failed to declare queue")?;

    let subscription = broker
        .subscribe(&config.broker.queue, &config.broker.consumer_tag)
        .await
        .context("Failed to subscribe to queue")?;

    let sink = MongoSink::connect(&config.store)
        .await
        .context("Failed to connect to document store")?;

    let pipeline = Pipeline::new(sink);

    // Arm the single-fire shutdown signal
    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown.send(());
    });

    let stats = pipeline.run(subscription.into_stream()).await;

    broker.close().await;

    info!(
        stored = stats.stored,
        dropped = stats.decode_failures + stats.storage_failures,
        "Worker stopped"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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

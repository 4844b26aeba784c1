//! Keybridge - identity event to Hasura projection service.
//!
//! Consumes the client-event and admin-event queues concurrently until
//! SIGINT/SIGTERM. See [`keybridge::config`] for configuration.

use keybridge::config::BridgeConfig;
use keybridge::dlq::RetryLimit;
use keybridge::event::EventFamily;
use keybridge::executor::{HasuraExecutor, LogExecutor, MutationExecutor};
use keybridge::health::{self, Metrics};
use keybridge::pipeline::Pipeline;
use keybridge::shutdown::ShutdownSignal;
use keybridge::transport::{ConnectionState, Transport, TransportError};
use keybridge::worker::{ExitReason, Worker, WorkerExit};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str) {
    // RUST_LOG wins over the configured level; an unparseable level falls back to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level.trim()).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_executor(config: &BridgeConfig) -> Arc<dyn MutationExecutor> {
    if config.hasura.dry_run {
        warn!("Dry run enabled, mutations will only be logged");
        return Arc::new(LogExecutor::new());
    }

    let executor = HasuraExecutor::new(&config.hasura.endpoint)
        .with_admin_secret(&config.hasura.admin_secret)
        .with_timeout(Duration::from_millis(config.hasura.timeout_ms));
    info!(endpoint = %executor.endpoint(), "Created Hasura executor");
    Arc::new(executor)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = BridgeConfig::load()?;
    init_tracing(&config.log_level);
    config.validate()?;

    info!(
        client_events_queue = %config.rabbitmq.client_events_queue,
        admin_events_queue = %config.rabbitmq.admin_events_queue,
        prefetch = config.rabbitmq.prefetch,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let shutdown = ShutdownSignal::with_drain_timeout(Duration::from_secs(config.shutdown_timeout_secs));

    let pipeline = Arc::new(
        Pipeline::new(build_executor(&config))
            .with_retry_limit(RetryLimit::from_config(config.rabbitmq.max_deliveries)),
    );

    info!("Connecting to RabbitMQ...");
    let (transport, mut states) = Transport::connect(&config.rabbitmq.uri).await?;

    // Connectivity transitions are observed for logs and /health only
    let state_metrics = metrics.clone();
    tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            match state {
                ConnectionState::Ready => {
                    info!("RabbitMQ connection is ready");
                    state_metrics.set_transport_ready(true);
                }
                ConnectionState::Unready(reason) => {
                    error!(reason = %reason, "RabbitMQ connection is not ready");
                    state_metrics.set_transport_ready(false);
                }
            }
        }
    });

    let prefetch = config.rabbitmq.prefetch;
    let client_stream = transport
        .consume(&config.rabbitmq.client_events_queue, prefetch)
        .await?;
    let admin_stream = transport
        .consume(&config.rabbitmq.admin_events_queue, prefetch)
        .await?;

    let mut workers: JoinSet<Result<WorkerExit, TransportError>> = JoinSet::new();
    workers.spawn(
        Worker::new(
            EventFamily::Client,
            &config.rabbitmq.client_events_queue,
            pipeline.clone(),
            metrics.clone(),
            shutdown.clone(),
        )
        .run(client_stream),
    );
    workers.spawn(
        Worker::new(
            EventFamily::Admin,
            &config.rabbitmq.admin_events_queue,
            pipeline.clone(),
            metrics.clone(),
            shutdown.clone(),
        )
        .run(admin_stream),
    );

    if let Some(port) = config.health.port {
        let health_metrics = metrics.clone();
        let health_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, health_metrics, health_shutdown).await {
                error!(error = %e, "Health endpoint failed");
            }
        });
    }

    info!(
        executor = %pipeline.executor_name(),
        max_deliveries = ?pipeline.retry_limit().max_deliveries(),
        "Start consuming messages"
    );

    let mut failed = false;
    tokio::select! {
        _ = shutdown.wait() => {
            info!("Got system signal, exiting...");
        }
        Some(result) = workers.join_next() => {
            failed = !report_worker(result);
            shutdown.trigger();
        }
    }

    // Let in-flight deliveries settle before closing the connection
    let drained = tokio::time::timeout(shutdown.drain_timeout(), async {
        let mut ok = true;
        while let Some(result) = workers.join_next().await {
            ok &= report_worker(result);
        }
        ok
    })
    .await;

    match drained {
        Ok(ok) => failed |= !ok,
        Err(_) => {
            warn!(
                timeout_secs = shutdown.drain_timeout().as_secs(),
                "Workers did not stop in time"
            );
            workers.abort_all();
        }
    }

    transport.close().await;

    if failed {
        return Err("a worker stopped unexpectedly".into());
    }

    info!("Shutdown complete");
    Ok(())
}

/// Log a worker's exit. Returns false if it stopped for any reason other
/// than a requested shutdown.
fn report_worker(
    result: Result<Result<WorkerExit, TransportError>, tokio::task::JoinError>,
) -> bool {
    match result {
        Ok(Ok(exit)) if exit.reason == ExitReason::Shutdown => {
            info!(queue = %exit.queue, processed = exit.stats.processed, "Worker finished");
            true
        }
        Ok(Ok(exit)) => {
            error!(queue = %exit.queue, reason = ?exit.reason, "Worker stopped unexpectedly");
            false
        }
        Ok(Err(e)) => {
            error!(error = %e, "Worker failed");
            false
        }
        Err(e) => {
            error!(error = %e, "Worker task panicked or was cancelled");
            false
        }
    }
}

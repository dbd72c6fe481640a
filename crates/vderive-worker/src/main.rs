//! Conversion worker binary.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use vderive_queue::{JobQueue, QueueConfig};
use vderive_storage::StorageConfig;
use vderive_worker::{FfmpegConvertRunner, JobExecutor, WorkerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vderive=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vderive-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr {
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            error!("Failed to start metrics exporter on {}: {}", addr, e);
            std::process::exit(1);
        }
        info!("Serving metrics on {}", addr);
    }

    let queue = match JobQueue::new(QueueConfig::from_env(), format!("worker-{}", Uuid::new_v4())) {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("Failed to create job queue: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = queue.init().await {
        error!("Failed to initialize job queue: {}", e);
        std::process::exit(1);
    }

    let files = match StorageConfig::from_env() {
        Ok(storage) => match storage.open().await {
            Ok(files) => files,
            Err(e) => {
                error!("Failed to open file storage: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("Invalid storage configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runner = Arc::new(FfmpegConvertRunner::new(config.job_timeout));
    let executor = Arc::new(
        JobExecutor::new(config, queue.clone(), queue.clone(), files, runner).with_claimer(queue),
    );

    // Setup signal handlers
    let shutdown_handle = tokio::spawn({
        let executor = executor.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            executor.shutdown();
        }
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    shutdown_handle.abort();
    info!("Worker shutdown complete");
}

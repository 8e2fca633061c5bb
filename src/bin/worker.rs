use std::sync::Arc;

use job_pipeline::{
    bootstrap,
    config::AppConfig,
    services::{event_bus::RedisEventBus, worker_pool::WorkerPool},
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting job-pipeline worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    // Without shared backends a separate worker process would see nothing.
    config
        .redis_url
        .as_ref()
        .expect("REDIS_URL is required for worker processes");
    config
        .database_url
        .as_ref()
        .expect("DATABASE_URL is required for worker processes");

    let topology = bootstrap::load_topology(&config).expect("Failed to load queue topology");
    let backends = bootstrap::connect_backends(&config)
        .await
        .expect("Failed to connect job store and broker");
    let transport = backends
        .transport
        .clone()
        .expect("Redis transport is connected when REDIS_URL is set");

    let executors =
        bootstrap::http_executors(&config, &topology).expect("Failed to initialize AI service client");

    let consumer = config.consumer_config();
    tracing::info!(
        consumer_id = %consumer.consumer_id,
        prefetch = consumer.prefetch,
        "Worker ready, starting consumers"
    );

    let (_shutdown_tx, shutdown_rx) = bootstrap::shutdown_channel();
    let pool = WorkerPool {
        topology,
        store: backends.store,
        broker: backends.broker,
        sink: Arc::new(RedisEventBus::new(transport.clone())),
        executors,
        policy: config.retry_policy(),
        consumer,
        stall_timeout: config.stall_timeout(),
        reconnects: Some(transport.on_reconnect()),
    };

    let mut tasks = pool.spawn(shutdown_rx);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Worker task failed");
        }
    }

    transport.close();
    tracing::info!("Worker stopped");
}

use std::sync::Arc;

use job_pipeline::{
    app_state::AppState,
    bootstrap,
    config::AppConfig,
    routes,
    services::{
        auth::TokenVerifier,
        event_bus::{self, RedisEventBus},
        fanout::{EventSink, Fanout},
        worker_pool::WorkerPool,
    },
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing job-pipeline API server");

    let prometheus_handle =
        Arc::new(telemetry::install_metrics().expect("Failed to install Prometheus metrics recorder"));

    let topology = bootstrap::load_topology(&config).expect("Failed to load queue topology");
    let backends = bootstrap::connect_backends(&config)
        .await
        .expect("Failed to connect job store and broker");

    let (shutdown_tx, shutdown_rx) = bootstrap::shutdown_channel();
    let mut background = tokio::task::JoinSet::new();

    // Events produced in other processes arrive over Redis; local ones take
    // the same path so every API process sees them.
    let fanout = Arc::new(Fanout::new());
    let sink: Arc<dyn EventSink> = match &backends.transport {
        Some(transport) => {
            background.spawn(event_bus::relay(
                transport.client().clone(),
                fanout.clone(),
                shutdown_rx.clone(),
            ));
            Arc::new(RedisEventBus::new(transport.clone()))
        }
        None => fanout.clone(),
    };

    let embedded = config.embedded_workers || backends.transport.is_none();
    let workers = if embedded {
        tracing::info!("Starting embedded workers");
        let executors = bootstrap::http_executors(&config, &topology)
            .expect("Failed to initialize AI service client");
        let pool = WorkerPool {
            topology: topology.clone(),
            store: backends.store.clone(),
            broker: backends.broker.clone(),
            sink: sink.clone(),
            executors,
            policy: config.retry_policy(),
            consumer: config.consumer_config(),
            stall_timeout: config.stall_timeout(),
            reconnects: backends.transport.as_ref().map(|t| t.on_reconnect()),
        };
        Some(pool.spawn(shutdown_rx.clone()))
    } else {
        None
    };

    let state = AppState::new(
        topology,
        backends.store,
        backends.broker,
        fanout,
        sink,
        TokenVerifier::new(&config.jwt_secret),
    );
    let app = routes::router(state, Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .expect("Server error");

    let _ = shutdown_tx.send(true);
    if let Some(mut workers) = workers {
        while workers.join_next().await.is_some() {}
    }
    while background.join_next().await.is_some() {}
    if let Some(transport) = &backends.transport {
        transport.close();
    }
    tracing::info!("Server stopped");
}

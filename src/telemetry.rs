use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// JSON logs, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Install the Prometheus recorder and register metric descriptions.
pub fn install_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!("jobs_submitted_total", "Jobs accepted by the dispatcher");
    metrics::describe_counter!("jobs_completed_total", "Jobs that reached COMPLETED");
    metrics::describe_counter!(
        "jobs_failed_total",
        "Jobs that reached FAILED (permanent or transport failure)"
    );
    metrics::describe_counter!(
        "jobs_dead_lettered_total",
        "Jobs dead-lettered after exhausting their attempts"
    );
    metrics::describe_counter!("jobs_retried_total", "Executions re-queued for another attempt");
    metrics::describe_counter!("jobs_cancelled_total", "Jobs cancelled before finishing");
    metrics::describe_counter!(
        "jobs_republished_total",
        "Queued jobs whose message was lost and published again"
    );
    metrics::describe_histogram!(
        "job_execution_seconds",
        metrics::Unit::Seconds,
        "Wall time of a single execution attempt"
    );
    metrics::describe_gauge!("queue_depth", "Messages waiting on a primary queue");
    metrics::describe_gauge!("push_connections", "Open push channel connections");
}

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Counter for records handled by the gate, labelled by `outcome`.
pub const RECORDS_TOTAL_COUNTER: &str = "dedup_records_total";

/// Counter for input units that could not be decoded into a record.
pub const DECODE_ERRORS_TOTAL_COUNTER: &str = "dedup_decode_errors_total";

/// Counter for `exists` calls that failed and were treated as "not found".
pub const STORE_READ_ERRORS_TOTAL_COUNTER: &str = "dedup_store_read_errors_total";

/// Histogram for store round trips, labelled by `operation`.
pub const STORE_OPERATION_DURATION_HISTOGRAM: &str = "dedup_store_operation_duration_seconds";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router for a metrics endpoint.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new().route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

//! Telemetry and structured logging for the conversion worker.

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;
use crate::job::{JobRecord, JobStatus};

const TRACER_NAME: &str = "geopdf-worker";

/// Jobs slower than this are logged as a warning.
const SLOW_JOB_THRESHOLD_MS: i64 = 5000;

/// Installs the global tracing subscriber. `RUST_LOG` sets the filter
/// (default `info`).
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Records telemetry for a job after one of its attempts ends.
///
/// Emits an OpenTelemetry span and a structured log line with:
/// - Job status and attempt count
/// - Duration (ms) once the job is terminal
/// - Failure kind and message (if failed)
pub fn record_job_telemetry(job: &JobRecord) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("geopdf_job");

    span.set_attribute(KeyValue::new("job_id", job.id.to_string()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("attempt_count", job.attempt_count as i64));
    span.set_attribute(KeyValue::new(
        "output_filename",
        job.payload.output_filename.clone(),
    ));

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.id,
            duration_ms = duration_ms,
            status = %job.status,
            attempts = job.attempt_count,
            "GeoPDF job finished"
        );

        if duration_ms > SLOW_JOB_THRESHOLD_MS {
            warn!(
                job_id = %job.id,
                duration_ms = duration_ms,
                "GeoPDF job exceeded performance threshold ({}ms)",
                SLOW_JOB_THRESHOLD_MS
            );
        }
    }

    if let Some(artifact) = &job.result {
        span.set_attribute(KeyValue::new("artifact_bytes", artifact.size_bytes as i64));
    }

    if job.status == JobStatus::Failed {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error_kind", error.kind.as_str()));
            span.set_attribute(KeyValue::new("error", error.message.clone()));
            warn!(
                job_id = %job.id,
                kind = %error.kind,
                error = %error.message,
                attempts = job.attempt_count,
                "GeoPDF job failed"
            );
        }
    } else if let Some(last) = job.failures.last() {
        span.set_attribute(KeyValue::new("last_failure_kind", last.kind.as_str()));
    }

    span.end();
}

/// Records a worker heartbeat with the current intake depth.
pub fn record_worker_heartbeat(worker_id: usize, queue_depth: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("worker_id", worker_id as i64));
    span.set_attribute(KeyValue::new("queue_depth", queue_depth as i64));
    span.end();

    info!(worker_id, queue_depth, "Worker heartbeat");
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Reads configuration from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: geopdf-worker)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

/// Flushes pending spans before exit.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

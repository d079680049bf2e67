//! Tracing subscriber setup with optional OTLP export
//!
//! Spans are exported only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set;
//! otherwise logs go to stdout alone.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

pub const SERVICE_NAME: &str = "pair-scheduler";

/// Builds the OTLP tracer for `endpoint`
fn otlp_tracer(endpoint: &str) -> Result<sdktrace::Tracer> {
    let mut attributes = vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ];
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config().with_resource(Resource::new(attributes)))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("Failed to initialize OTLP tracer: {}", e)))
}

/// Installs the global subscriber
///
/// The filter defaults to INFO and honours `RUST_LOG`. `log_json` switches
/// the stdout layer to JSON lines.
pub fn init_telemetry(log_json: bool) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (plain, json) = if log_json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let otel_layer = match endpoint.as_deref() {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };
    let otel_enabled = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("Failed to initialize tracing: {}", e)))?;

    if otel_enabled {
        tracing::info!("OpenTelemetry tracing initialized");
    } else {
        tracing::info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
    Ok(())
}

/// Flushes pending spans
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

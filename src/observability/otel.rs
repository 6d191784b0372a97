//! # OpenTelemetry Support
//!
//! Plain OTLP (gRPC) trace export, initialized entirely from the standard
//! `OTEL_EXPORTER_OTLP_ENDPOINT`/`OTEL_SERVICE_NAME` environment variables —
//! no per-CRD tracing configuration. Tracing is optional: when no OTLP
//! endpoint is configured, the caller falls back to a plain
//! `tracing_subscriber` formatter.

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracer provider and the `tracing` subscriber
/// together, since the OTel layer has to be composed into the same
/// subscriber as the env-filter/fmt layer rather than installed separately.
///
/// Returns `Ok(None)` and leaves the subscriber uninitialized when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is not set — the caller installs a plain
/// `tracing_subscriber::fmt` subscriber in that case.
pub fn init_otel() -> Result<Option<SdkTracerProvider>> {
    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        return Ok(None);
    };

    let service_name = std::env::var("OTEL_SERVICE_NAME")
        .unwrap_or_else(|_| "git-change-operator".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()
        .context("building OTLP span exporter")?;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name)
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer("git-change-operator");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("git_change_operator=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .context("installing tracing subscriber with OpenTelemetry layer")?;

    info!(endpoint = %endpoint, "OpenTelemetry OTLP tracing initialized");
    Ok(Some(provider))
}

/// Flushes and shuts down the tracer provider. Safe to call with `None`.
pub fn shutdown_otel(provider: Option<SdkTracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "error shutting down OpenTelemetry tracer provider");
        }
    }
}

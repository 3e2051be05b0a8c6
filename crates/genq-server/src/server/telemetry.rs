//! # Telemetry Features
//!
//! Console logging through `tracing_subscriber::fmt` is always on. OpenTelemetry
//! export is opt-in.
//!
//! ## Feature matrix
//!
//! - `otlp`: Exports spans over OTLP (HTTP/protobuf).
//! - `metrics`: Exports HTTP-level metrics over OTLP (HTTP/protobuf).
//!
//! The exporter endpoint and headers come from the standard
//! `OTEL_EXPORTER_OTLP_*` environment variables.
//!
//! ## Span behavior
//!
//! - Spans created via `tracing::info_span!` or `#[tracing::instrument]` are
//!   exported when `otlp` is enabled
//! - Events inside a span become span events; events outside a span only
//!   appear in log output
//!
//! ## Metrics behavior
//!
//! - Submissions by outcome, status queries by status, rejected requests by
//!   error code, and request durations
//! - The helper functions below compile to no-ops without `metrics`
//!
//! ## Example usage
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4318 cargo run --features otlp,metrics
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "otlp"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otlp"))]
use opentelemetry_otlp::{Protocol, WithExportConfig};
#[cfg(any(feature = "metrics", feature = "otlp"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otlp"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "otlp")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "genq";

pub struct TelemetryProviders {
    #[cfg(feature = "otlp")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down the exporters. Errors are printed, since the
    /// subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "otlp")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otlp")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otlp")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "otlp"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "otlp")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "otlp")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otlp"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    use anyhow::Context;

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build metrics exporter")?;

    Ok(sdkmetrics::SdkMeterProvider::builder()
        .with_resource(resource())
        .with_periodic_exporter(exporter)
        .build())
}

#[cfg(feature = "otlp")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    use anyhow::Context;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build tracer exporter")?;

    let batch = sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build();

    Ok(sdktrace::SdkTracerProvider::builder()
        .with_resource(resource())
        .with_span_processor(batch)
        .build())
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static SUBMISSIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static STATUS_QUERIES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REJECTIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = SUBMISSIONS.set(
        meter
            .u64_counter("submissions")
            .with_description("Generation submissions by outcome")
            .build(),
    );

    let _ = STATUS_QUERIES.set(
        meter
            .u64_counter("status_queries")
            .with_description("Task status queries by resulting status")
            .build(),
    );

    let _ = REJECTIONS.set(
        meter
            .u64_counter("rejections")
            .with_description("Requests answered with an error, by error code")
            .build(),
    );

    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("End-to-end HTTP request duration")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn record_submission(outcome: &'static str) {
    if let Some(counter) = SUBMISSIONS.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_submission(_outcome: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_status_query(status: &'static str) {
    if let Some(counter) = STATUS_QUERIES.get() {
        counter.add(1, &[KeyValue::new("status", status)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_status_query(_status: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_rejection(code: &'static str) {
    if let Some(counter) = REJECTIONS.get() {
        counter.add(1, &[KeyValue::new("code", code)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_rejection(_code: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_request_duration(route: String, status: u16, duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(
            duration_ms,
            &[
                KeyValue::new("route", route),
                KeyValue::new("status", i64::from(status)),
            ],
        );
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_duration(_route: String, _status: u16, _duration_ms: f64) {}

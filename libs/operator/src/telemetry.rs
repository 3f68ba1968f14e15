use crate::error::{Error, Result};

use std::fmt;

use opentelemetry::trace::{TraceContextExt, TraceId, TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as fmt_layer};

pub const SERVICE_NAME: &str = "ibiop";

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

fn build_tracer(tracing_url: &str, sample_ratio: f64) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(tracing_url)
        .build()
        .map_err(|e| Error::TelemetryError(format!("failed to build OTLP exporter: {e}")))?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sample_ratio))
        .with_resource(
            Resource::builder()
                .with_service_name(SERVICE_NAME)
                .build(),
        )
        .build())
}

/// Initialize the tracing subscriber stack: an `EnvFilter` from `log_filter`,
/// a fmt layer in the requested format, and an optional OTLP trace layer when
/// `tracing_url` is provided.
pub async fn init(
    log_filter: &str,
    log_format: LogFormat,
    tracing_url: Option<&str>,
    sample_ratio: f64,
) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_filter)
        .map_err(|e| Error::TelemetryError(format!("invalid log filter {log_filter:?}: {e}")))?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let otel_layer = match tracing_url {
        Some(url) => {
            let provider = build_tracer(url, sample_ratio)?;
            let tracer = provider.tracer(SERVICE_NAME);
            opentelemetry::global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    let registry = registry.with(otel_layer);

    match log_format {
        LogFormat::Text => registry.with(fmt_layer::layer()).try_init(),
        LogFormat::Json => registry
            .with(fmt_layer::layer().json().flatten_event(true))
            .try_init(),
    }
    .map_err(|e| Error::TelemetryError(format!("failed to initialize subscriber: {e}")))
}

use std::collections::HashMap;

use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `"json"` (any case) selects JSON lines; everything else is text.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn otlp_headers(token: Option<&str>) -> HashMap<String, String> {
    token
        .filter(|t| !t.is_empty())
        .map(|t| ("Authorization".to_string(), format!("Bearer {t}")))
        .into_iter()
        .collect()
}

fn build_provider(
    service_name: &str,
    endpoint: &str,
    token: Option<&str>,
) -> Result<TracerProvider, opentelemetry::trace::TraceError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(otlp_headers(token))
        .build()?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build())
}

/// Install the global subscriber: `RUST_LOG`-style filtering (default
/// `info`), text or JSON output, and OTLP/HTTP span export when
/// `otlp_endpoint` is set (the exporter appends `/v1/traces`).
///
/// Returns the tracer provider when export is on; keep it alive and call
/// `shutdown()` on it before exit.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    otlp_token: Option<&str>,
    log_format: &str,
) -> Option<TracerProvider> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match LogFormat::parse(log_format) {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    let provider = otlp_endpoint.and_then(|endpoint| {
        match build_provider(service_name, endpoint, otlp_token) {
            Ok(p) => Some(p),
            Err(err) => {
                eprintln!("failed to create OTLP exporter: {err}, logging to stdout only");
                None
            }
        }
    });
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name.to_string())));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if let (Some(endpoint), Some(_)) = (otlp_endpoint, provider.as_ref()) {
        tracing::info!(endpoint, service_name, "OTLP tracing enabled");
    }
    provider
}

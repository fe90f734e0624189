//! Logging, tracing and metrics export for the operator process.
//!
//! Logs are always JSON on stdout. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! spans and metrics are also exported over OTLP/gRPC.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Pod metadata exposed through the downward API, as resource attributes
const POD_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("OTLP {signal} exporter: {message}")]
    Exporter {
        signal: &'static str,
        message: String,
    },

    #[error("tracing subscriber already installed: {0}")]
    Subscriber(String),
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported as `service.name`
    pub service_name: String,

    /// Collector address, e.g. "http://otel-collector:4317"
    pub otlp_endpoint: Option<String>,

    /// Directives used when RUST_LOG is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let controllers = ["engine", "cluster", "machine", "network", "storage"]
            .map(|c| format!("stratus_{c}=debug"))
            .join(",");
        Self {
            service_name: "stratus-operator".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
            default_filter: format!("info,{controllers},kube=info,tower=warn,hyper=warn"),
        }
    }
}

/// Install the global subscriber, plus OTLP exporters when configured.
/// Call once, early in `main`.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let logs = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    let spans = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = resource(&config.service_name);
            global::set_meter_provider(meter_provider(endpoint, resource.clone())?);
            let provider = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(logs)
        .with(spans)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

fn resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(
        POD_ATTRIBUTES
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| KeyValue::new(*key, v))),
    );
    Resource::new(attributes)
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl FnOnce(E) -> TelemetryError {
    move |e| TelemetryError::Exporter {
        signal,
        message: e.to_string(),
    }
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("trace"))?;
    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("metrics"))?;
    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_keeps_controllers_at_debug() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "stratus-operator");
        assert!(config.default_filter.starts_with("info,"));
        assert!(config.default_filter.contains("stratus_machine=debug"));
        assert!(config.default_filter.contains("stratus_storage=debug"));
    }

    #[test]
    fn resource_carries_service_name() {
        let resource = resource("test-service");
        assert!(!resource.is_empty());
    }
}

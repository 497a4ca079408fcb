use base64::Engine;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider, ObservableGauge};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{MetricExporter, Protocol, SpanExporter, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::metrics::periodic_reader_with_async_runtime::PeriodicReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor;
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer};
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{warn, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LoggingConfig, ObservabilityConfig};
use crate::rate_limit::RateLimiter;

const METER_NAME: &str = "syno-gateway";

#[derive(Clone)]
pub struct Metrics {
    pub requests: Counter<u64>,
    pub errors: Counter<u64>,
    pub latency_ms: Histogram<f64>,
    pub rate_limited: Counter<u64>,
    _tracked_ips: ObservableGauge<u64>,
}

impl Metrics {
    fn from_meter(meter: &Meter, limiter: Arc<RateLimiter>) -> Self {
        let requests = meter
            .u64_counter("syno.api.requests")
            .with_description("Total API requests")
            .build();
        let errors = meter
            .u64_counter("syno.api.errors")
            .with_description("API requests that ended in an error response")
            .build();
        let latency_ms = meter
            .f64_histogram("syno.api.latency_ms")
            .with_unit("ms")
            .with_description("Request latency in ms")
            .build();
        let rate_limited = meter
            .u64_counter("syno.api.rate_limit.rejections")
            .with_description("Requests rejected by the per-IP limiter")
            .build();
        let tracked_ips = meter
            .u64_observable_gauge("syno.api.rate_limit.tracked_ips")
            .with_description("Client IPs with a live rate-limit bucket")
            .with_callback(move |observer| {
                observer.observe(limiter.tracked_clients() as u64, &[]);
            })
            .build();

        Self {
            requests,
            errors,
            latency_ms,
            rate_limited,
            _tracked_ips: tracked_ips,
        }
    }
}

fn basic_auth_headers(public_key: &str, secret_key: &str) -> HashMap<String, String> {
    if public_key.is_empty() && secret_key.is_empty() {
        return HashMap::new();
    }
    let auth = base64::engine::general_purpose::STANDARD.encode(format!(
        "{}:{}",
        public_key, secret_key
    ));
    HashMap::from([(String::from("Authorization"), format!("Basic {}", auth))])
}

pub fn init_metrics(
    config: &ObservabilityConfig,
    limiter: Arc<RateLimiter>,
) -> Result<Metrics, String> {
    let exporter = match config.exporters.metrics.as_str() {
        "none" => return Ok(init_metrics_noop(limiter)),
        "otlp_http" => MetricExporter::builder()
            .with_http()
            .with_endpoint(config.otlp_http.metrics_endpoint())
            .with_protocol(Protocol::HttpBinary)
            .with_timeout(Duration::from_millis(config.otlp_http.timeout_ms))
            .with_headers(basic_auth_headers(
                &config.otlp_http.public_key,
                &config.otlp_http.secret_key,
            ))
            .build()
            .map_err(|e| format!("metrics exporter init error: {}", e))?,
        _ => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(config.otlp_grpc.endpoint.clone())
            .with_protocol(Protocol::Grpc)
            .with_timeout(Duration::from_millis(config.otlp_grpc.timeout_ms))
            .build()
            .map_err(|e| format!("metrics exporter init error: {}", e))?,
    };

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    let meter = provider.meter(METER_NAME);
    global::set_meter_provider(provider);
    Ok(Metrics::from_meter(&meter, limiter))
}

/// Instruments backed by the global (noop unless configured) meter provider.
pub fn init_metrics_noop(limiter: Arc<RateLimiter>) -> Metrics {
    Metrics::from_meter(&global::meter(METER_NAME), limiter)
}

pub fn init_tracer(config: &ObservabilityConfig) -> Result<SdkTracerProvider, String> {
    let exporter = match config.exporters.tracing.as_str() {
        "none" => return Ok(init_tracer_noop(config.service_name.clone())),
        "otlp_http" => SpanExporter::builder()
            .with_http()
            .with_endpoint(config.otlp_http.traces_endpoint())
            .with_protocol(Protocol::HttpBinary)
            .with_timeout(Duration::from_millis(config.otlp_http.timeout_ms))
            .with_headers(basic_auth_headers(
                &config.otlp_http.public_key,
                &config.otlp_http.secret_key,
            ))
            .build()
            .map_err(|e| format!("trace exporter init error: {}", e))?,
        _ => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(config.otlp_grpc.endpoint.clone())
            .with_timeout(Duration::from_millis(config.otlp_grpc.timeout_ms))
            .build()
            .map_err(|e| format!("trace exporter init error: {}", e))?,
    };

    let batch = BatchSpanProcessor::builder(exporter, runtime::Tokio).build();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(batch)
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    hold_tracer_provider(provider.clone());
    Ok(provider)
}

pub fn init_tracer_noop(service_name: String) -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();
    hold_tracer_provider(provider.clone());
    provider
}

fn hold_tracer_provider(provider: SdkTracerProvider) {
    static GLOBAL_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();
    let _ = GLOBAL_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider);
}

pub fn spawn_tracer_watchdog(provider: SdkTracerProvider) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(30));
        if let Err(err) = provider.force_flush() {
            warn!(
                "tracer provider force_flush failed (batch worker may be down): {}",
                err
            );
        }
    })
}

fn open_log_file(path: &str) -> Option<std::fs::File> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("log file create dir error: {}", err);
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log file open error: {}", err);
            None
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn log_writer(config: &LoggingConfig) -> BoxMakeWriter {
    let file_writer = config.file.as_deref().and_then(open_log_file).map(Arc::new);
    match (config.stdout, file_writer) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stdout.and(file)),
        (true, None) => BoxMakeWriter::new(std::io::stdout),
        (false, Some(file)) => BoxMakeWriter::new(file),
        (false, None) => BoxMakeWriter::new(std::io::stdout),
    }
}

/// Bridges `tracing` spans into the given provider's exporter.
pub fn otel_layer<S>(provider: &SdkTracerProvider, service_name: &str) -> OpenTelemetryLayer<S, Tracer>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
}

/// Installs the global subscriber: fmt output, level filter and the
/// OpenTelemetry bridge.
pub fn init_logging(config: &LoggingConfig, provider: &SdkTracerProvider, service_name: &str) {
    let writer = log_writer(config);
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_writer(writer).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(&config.level))
        .with(otel_layer(provider, service_name))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    #[test]
    fn basic_auth_only_with_keys() {
        assert!(basic_auth_headers("", "").is_empty());
        let headers = basic_auth_headers("pk", "sk");
        assert_eq!(headers["Authorization"], "Basic cGs6c2s=");
    }

    #[tokio::test]
    async fn noop_exporters_need_no_collector() {
        let config = ObservabilityConfig::default();
        let limiter = Arc::new(RateLimiter::new(
            5,
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let metrics = init_metrics(&config, limiter.clone()).expect("noop metrics");
        metrics.requests.add(1, &[]);
        assert!(init_tracer(&config).is_ok());
    }

    #[test]
    fn request_spans_reach_the_exporter() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber = Registry::default().with(otel_layer(&provider, "syno-gateway"));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info_span!("api.request", endpoint = "Lookup").in_scope(|| {});
        });
        provider.force_flush().expect("flush");

        let spans = exporter.get_finished_spans().expect("spans");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "api.request");
    }
}

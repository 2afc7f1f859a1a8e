//! Telemetry logic.
//! Support tracing, process metrics and logging.
use axum::extract::{MatchedPath, Request, State};
use axum::http::Version;
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics::Unit;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Span, TraceError, Tracer};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::LogExporter;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::logs::{LogError, SdkLogger};
use opentelemetry_sdk::trace::SdkTracerProvider;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::time::{Duration, Instant};

use crate::registry::{CounterRegistry, HTTP_REQUESTS_DURATION};

const PROCESS_REFRESH: Duration = Duration::from_secs(10);
const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

fn ressources() -> Resource {
    Resource::builder().with_service_name("metrics-relay").build()
}

/// Create tracer for OLTP.
pub fn setup_tracer(endpoint: &str) -> Result<SdkTracerProvider, TraceError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(ressources())
        .build())
}

/// Create OLTP exporter for logs.
pub fn setup_logging(
    endpoint: &str,
) -> Result<OpenTelemetryTracingBridge<SdkLoggerProvider, SdkLogger>, LogError> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider: SdkLoggerProvider = SdkLoggerProvider::builder()
        .with_resource(ressources())
        .with_batch_exporter(exporter)
        .build();
    Ok(OpenTelemetryTracingBridge::new(&provider))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
}

/// Run `f` under a plain stderr subscriber, for what is logged before
/// [`init_subscriber`] can be called, such as reading the configuration.
pub fn with_bootstrap_subscriber<T>(f: impl FnOnce() -> T) -> T {
    with_bootstrap_writer(std::io::stderr, f)
}

fn with_bootstrap_writer<W, T>(writer: W, f: impl FnOnce() -> T) -> T
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, f)
}

/// Install the global `tracing` subscriber.
///
/// Filter comes from `RUST_LOG`, `info` by default. Logs are also exported
/// over OTLP when `otlp_endpoint` is set.
pub fn init_subscriber(otlp_endpoint: Option<&str>) {
    let otlp = otlp_endpoint.and_then(|endpoint| match setup_logging(endpoint) {
        Ok(layer) => Some(layer),
        Err(err) => {
            eprintln!("OTLP log export disabled: {err}");
            None
        },
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(otlp)
        .init();

    if let Some(endpoint) = otlp_endpoint {
        match setup_tracer(endpoint) {
            Ok(provider) => {
                global::set_tracer_provider(provider);
            },
            Err(err) => tracing::warn!(error = %err, "OTLP span export disabled"),
        }
    }
}

/// Sample process CPU and memory into `registry` in the background.
pub fn spawn_process_collector(registry: CounterRegistry) -> JoinHandle<()> {
    registry.describe_gauge(
        "process_cpu_usage",
        Unit::Percent,
        "CPU usage of the process in percentage.",
    );
    registry.describe_gauge(
        "process_memory_used_bytes",
        Unit::Bytes,
        "Total process memory in bytes.",
    );

    let mut system = System::new_with_specifics(RefreshKind::nothing());
    let pid = Pid::from_u32(std::process::id());

    tokio::spawn(async move {
        loop {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory().with_cpu(),
            );

            if let Some(process) = system.process(pid) {
                registry.set_gauge("process_memory_used_bytes", process.memory() as f64);
                registry.set_gauge("process_cpu_usage", process.cpu_usage() as f64);
            }

            sleep(PROCESS_REFRESH).await;
        }
    })
}

/// Count and time every request.
pub async fn track(
    State(registry): State<CounterRegistry>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let tracer = global::tracer("tracing-http");
    let mut otel_span = tracer.start("http-request");

    let start = Instant::now();
    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();
    let version = match req.version() {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "UNKNOWN",
    };

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    otel_span.set_attribute(KeyValue::new("version", version));
    otel_span.set_attribute(KeyValue::new("path", path.clone()));
    otel_span.set_attribute(KeyValue::new("method", method.to_string()));
    otel_span.set_attribute(KeyValue::new("status", status.clone()));

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];
    registry.increment_raw(HTTP_REQUESTS_TOTAL, &labels, 1);
    registry.record_histogram(HTTP_REQUESTS_DURATION, &labels, latency);

    otel_span.end();

    response
}

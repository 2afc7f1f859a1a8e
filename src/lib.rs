//! metrics-relay receives events relayed by the frontend, counts them for
//! Prometheus and keeps every one of them in an append-only log.
#![forbid(unsafe_code)]

pub mod config;
pub mod emitter;
pub mod error;
pub mod event;
pub mod helpers;
pub mod ingest;
pub mod registry;
mod router;
pub mod sink;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::FromRef;
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use error::ServerError;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::ingest::Ingestor;
use crate::registry::CounterRegistry;
use crate::sink::LogSink;

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use axum::http::header;
    use tower::util::ServiceExt;

    app.oneshot(
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

/// State with default configuration, logging to `log_path`.
#[cfg(test)]
pub async fn test_state(log_path: impl AsRef<std::path::Path>) -> AppState {
    let config = config::Configuration::default();
    let registry = CounterRegistry::new().unwrap();
    let sink = LogSink::open(log_path).await.unwrap();
    let ingestor = Ingestor::new(&registry, &config.metrics, sink).unwrap();

    AppState {
        config: Arc::new(config),
        registry,
        ingestor,
    }
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub registry: CounterRegistry,
    pub ingestor: Ingestor,
}

impl FromRef<AppState> for CounterRegistry {
    fn from_ref(state: &AppState) -> CounterRegistry {
        state.registry.clone()
    }
}

impl FromRef<AppState> for Ingestor {
    fn from_ref(state: &AppState) -> Ingestor {
        state.ingestor.clone()
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // The frontend is served from another origin.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        );

    Router::new()
        // `POST /metrics-client` goes to `ingest`.
        .route("/metrics-client", post(router::ingest::handler))
        // `GET /metrics` goes to `scrape`.
        .route("/metrics", get(router::scrape::handler))
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.registry.clone(),
            telemetry::track,
        ))
        .with_state(state)
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let registry = CounterRegistry::new()?;

    let sink = helpers::retry(&config.startup, "event log", || {
        LogSink::open(&config.log_path)
    })
    .await?;

    let ingestor = Ingestor::new(&registry, &config.metrics, sink)?;

    Ok(AppState {
        config,
        registry,
        ingestor,
    })
}

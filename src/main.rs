use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use metrics_relay::config::Configuration;
use metrics_relay::{app, helpers, initialize_state, telemetry};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> ExitCode {
    // the configured subscriber is only known once the file is read.
    let config = telemetry::with_bootstrap_subscriber(|| {
        Configuration::default()
            .path(std::env::var("CONFIG_PATH").map(PathBuf::from).unwrap_or_default())
            .read()
    });

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            telemetry::with_bootstrap_subscriber(|| {
                tracing::error!(error = %err, "invalid configuration");
            });
            return ExitCode::FAILURE;
        },
    };

    telemetry::init_subscriber(config.telemetry.otlp_endpoint.as_deref());
    tracing::info!(version = config.version(), "starting metrics-relay");

    let state = match initialize_state(config.clone()).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "cannot initialize state");
            return ExitCode::FAILURE;
        },
    };

    telemetry::spawn_process_collector(state.registry.clone());

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener =
        match helpers::retry(&config.startup, "listener", || TcpListener::bind(addr)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%addr, error = %err, "cannot bind listener");
                return ExitCode::FAILURE;
            },
        };

    tracing::info!(%addr, log_path = %config.log_path.display(), "server started");

    if let Err(err) = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server stopped unexpectedly");
        return ExitCode::FAILURE;
    }

    tracing::info!("server shutdown complete");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for shutdown signal");
    }
}

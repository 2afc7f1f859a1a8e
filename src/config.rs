//! Configuration manager for metrics-relay.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_PORT: u16 = 5050;
const DEFAULT_LOG_PATH: &str = "logs/metrics-client.log";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:5050/metrics-client";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors that may occur while loading the configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid `{variable}` environment variable: {value}")]
    Env { variable: &'static str, value: String },
    #[error("URL is invalid: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Listening port. `PORT` takes precedence.
    pub port: u16,
    /// JSON-lines file receiving every ingested event.
    /// `METRICS_LOG_PATH` takes precedence.
    pub log_path: PathBuf,
    /// Event kinds backed by a counter.
    pub metrics: Vec<CounterKind>,
    /// Related to the client-side relay.
    pub emitter: Emitter,
    /// Related to boot-time dependencies.
    pub startup: Startup,
    /// Related to OpenTelemetry export.
    pub telemetry: Telemetry,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            metrics: vec![CounterKind {
                event: "frontend_route_change".into(),
                name: None,
                help: "Total route changes in frontend".into(),
                labels: vec!["path".into()],
            }],
            emitter: Emitter::default(),
            startup: Startup::default(),
            telemetry: Telemetry::default(),
            version: VERSION.to_owned(),
            path: PathBuf::default(),
        }
    }
}

/// An event name recognized by the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterKind {
    /// Event name sent by clients.
    pub event: String,
    /// Counter name. Default is `<event>_total`.
    pub name: Option<String>,
    #[serde(default)]
    pub help: String,
    /// Declared label dimensions, in order.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl CounterKind {
    /// Name of the backing counter.
    pub fn counter_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_total", self.event))
    }
}

/// Client relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Emitter {
    /// Ingestion endpoint URL.
    pub endpoint: String,
    /// Per-request timeout. Transport default when absent.
    pub timeout_secs: Option<u64>,
}

impl Default for Emitter {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            timeout_secs: None,
        }
    }
}

impl Emitter {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Bounded retry applied to boot-time dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Startup {
    pub attempts: u32,
    pub delay_secs: u64,
}

impl Default for Startup {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_secs: 5,
        }
    }
}

impl Startup {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// OpenTelemetry configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    /// gRPC OTLP collector, e.g. `http://localhost:4317`.
    pub otlp_endpoint: Option<String>,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location, then applies environment overrides.
    pub fn read(self) -> Result<Arc<Self>, Error> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let mut config = match File::open(&file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(config) => config,
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        config.version = VERSION.to_owned();
        config.path = file_path;
        config.apply_env(|key| std::env::var(key).ok())?;

        // reject a malformed endpoint on boot rather than on first emit.
        Url::parse(&config.emitter.endpoint)?;

        Ok(Arc::new(config))
    }

    /// Overrides values from environment variables.
    fn apply_env(
        &mut self,
        var: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), Error> {
        if let Some(port) = var("PORT") {
            self.port = port.parse().map_err(|_| Error::Env {
                variable: "PORT",
                value: port,
            })?;
        }

        if let Some(path) = var("METRICS_LOG_PATH") {
            self.log_path = PathBuf::from(path);
        }

        Ok(())
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file cannot be read, using defaults");
        Self::default()
    }
}

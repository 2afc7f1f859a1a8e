//! Client-side relay of events to the ingestion endpoint.
//!
//! Every emission runs on its own detached task: the caller never waits and
//! never sees a failure. Lost events are not retried.

use std::collections::HashMap;

use chrono::Utc;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use url::Url;

use crate::config;
use crate::event::Event;

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("no tokio runtime available to relay events")]
    NoRuntime,
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("cannot build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("metric push failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Fire-and-forget relay.
#[derive(Debug, Clone)]
pub struct Emitter {
    client: Client,
    endpoint: Url,
    runtime: Handle,
}

impl Emitter {
    /// Build an emitter bound to the current tokio runtime.
    pub fn new(config: &config::Emitter) -> Result<Self, EmitError> {
        let runtime = Handle::try_current().map_err(|_| EmitError::NoRuntime)?;
        let endpoint = Url::parse(&config.endpoint)?;

        let mut client = Client::builder();
        if let Some(timeout) = config.timeout() {
            client = client.timeout(timeout);
        }

        Ok(Self {
            client: client.build().map_err(EmitError::Client)?,
            endpoint,
            runtime,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Relay `name` with `value` (1 when `None`) and `labels`.
    ///
    /// Returns immediately. The handle may be dropped; awaiting it only
    /// reports what was already logged.
    pub fn emit(
        &self,
        name: impl Into<String>,
        value: Option<f64>,
        labels: HashMap<String, String>,
    ) -> JoinHandle<Result<(), EmitError>> {
        let mut event = Event::new(name).context(labels);
        event.value = value;
        self.record(event)
    }

    /// Relay a prebuilt event, stamping it with the capture time if unset.
    pub fn record(&self, mut event: Event) -> JoinHandle<Result<(), EmitError>> {
        event.timestamp.get_or_insert_with(Utc::now);

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        self.runtime.spawn(async move {
            let result = send(&client, endpoint, &event).await;
            if let Err(err) = &result {
                tracing::warn!(event = event.event, error = %err, "metric push failed");
            }
            result
        })
    }
}

async fn send(client: &Client, endpoint: Url, event: &Event) -> Result<(), EmitError> {
    client
        .post(endpoint)
        .json(event)
        .send()
        .await?
        .error_for_status()?;

    Ok(())
}

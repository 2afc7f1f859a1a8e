//! `POST /metrics-client`.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::Event;
use crate::ingest::Ingestor;
use crate::router::Valid;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: String,
    pub counted: bool,
}

/// Handler receiving relayed events.
///
/// Answers only once the event is written to the log.
pub async fn handler(
    State(ingestor): State<Ingestor>,
    Valid(event): Valid<Event>,
) -> Result<Json<Response>> {
    let outcome = ingestor.ingest(event).await?;

    Ok(Json(Response {
        status: "ok".to_owned(),
        counted: outcome.counted,
    }))
}

//! Wire body of a relayed event and the record written to the event log.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use validator::{Validate, ValidationError};

/// Value applied when an event carries none.
pub const DEFAULT_VALUE: f64 = 1.0;

/// Event relayed by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Event {
    #[validate(length(min = 1, max = 255, message = "Event name must be between 1 and 255 characters."))]
    pub event: String,
    #[validate(custom(
        function = "validate_value",
        message = "Value must be a finite, non-negative number."
    ))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            value: None,
            context: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Add one label to the context.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn context(mut self, context: HashMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Value with the default applied.
    pub fn effective_value(&self) -> f64 {
        self.value.unwrap_or(DEFAULT_VALUE)
    }

    /// Value as an integer counter increment. `None` for fractional values
    /// and values past `u64::MAX`.
    pub fn amount(&self) -> Option<u64> {
        as_amount(self.effective_value())
    }
}

fn as_amount(value: f64) -> Option<u64> {
    // 2^64 is the first f64 past `u64::MAX`.
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value < 18_446_744_073_709_551_616.0 {
        Some(value as u64)
    } else {
        None
    }
}

fn validate_value(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("value"))
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub event: String,
    #[serde(serialize_with = "serialize_value")]
    pub value: f64,
    pub context: HashMap<String, String>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Build the record of `event`, stamped with `received_at` when the
    /// client sent no timestamp.
    pub fn from_event(event: Event, received_at: DateTime<Utc>) -> Self {
        Self {
            value: event.effective_value(),
            timestamp: event.timestamp.unwrap_or(received_at),
            event: event.event,
            context: event.context,
        }
    }
}

/// Whole values are written as integers, `1` rather than `1.0`.
fn serialize_value<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    match as_amount(*value) {
        Some(amount) => serializer.serialize_u64(amount),
        None => serializer.serialize_f64(*value),
    }
}

fn serialize_timestamp<S: Serializer>(
    timestamp: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
}

//! Dispatch of relayed events to counters and the event log.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::CounterKind;
use crate::event::{Event, LogRecord};
use crate::registry::{Counter, CounterRegistry, RegistryError};
use crate::sink::{LogSink, SinkError};

/// Result of an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Whether a counter was incremented.
    pub counted: bool,
}

/// Routes events to their counter, then to the log.
#[derive(Debug, Clone)]
pub struct Ingestor {
    kinds: Arc<HashMap<String, Counter>>,
    sink: LogSink,
}

impl Ingestor {
    /// Register one counter per configured event kind.
    pub fn new(
        registry: &CounterRegistry,
        kinds: &[CounterKind],
        sink: LogSink,
    ) -> Result<Self, RegistryError> {
        let kinds = kinds
            .iter()
            .map(|kind| {
                let labels: Vec<&str> = kind.labels.iter().map(String::as_str).collect();
                let counter = registry.register(&kind.counter_name(), &kind.help, &labels)?;
                Ok((kind.event.clone(), counter))
            })
            .collect::<Result<HashMap<_, _>, RegistryError>>()?;

        Ok(Self {
            kinds: Arc::new(kinds),
            sink,
        })
    }

    /// Count `event` when its name is recognized, then append it to the log.
    ///
    /// An increment is never rolled back when the append fails.
    pub async fn ingest(&self, event: Event) -> Result<Outcome, SinkError> {
        let received_at = Utc::now();
        let counted = self.count(&event);

        let record = LogRecord::from_event(event, received_at);
        self.sink.append(&record).await?;

        Ok(Outcome { counted })
    }

    fn count(&self, event: &Event) -> bool {
        let Some(counter) = self.kinds.get(&event.event) else {
            tracing::debug!(event = event.event, "unrecognized event, logged only");
            return false;
        };

        // counters hold integer totals, the event is still logged.
        let Some(amount) = event.amount() else {
            tracing::warn!(
                event = event.event,
                value = event.effective_value(),
                "value is not a whole number, event not counted"
            );
            return false;
        };

        match counter.increment(&event.context, amount) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(event = event.event, error = %err, "event not counted");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    async fn ingestor(dir: &tempfile::TempDir) -> (CounterRegistry, Ingestor) {
        let registry = CounterRegistry::new().unwrap();
        let sink = LogSink::open(dir.path().join("events.log")).await.unwrap();
        let ingestor =
            Ingestor::new(&registry, &Configuration::default().metrics, sink).unwrap();
        (registry, ingestor)
    }

    fn lines(dir: &tempfile::TempDir) -> usize {
        std::fs::read_to_string(dir.path().join("events.log"))
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn test_recognized_event_is_counted_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ingestor) = ingestor(&dir).await;

        let outcome = ingestor
            .ingest(Event::new("frontend_route_change").value(2.0).label("path", "/login"))
            .await
            .unwrap();

        assert!(outcome.counted);
        assert!(registry
            .render()
            .contains(r#"frontend_route_change_total{path="/login"} 2"#));
        assert_eq!(lines(&dir), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_is_only_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ingestor) = ingestor(&dir).await;
        let before = registry.render();

        let outcome = ingestor
            .ingest(Event::new("button_click").label("path", "/"))
            .await
            .unwrap();

        assert!(!outcome.counted);
        assert_eq!(registry.render(), before);
        assert_eq!(lines(&dir), 1);
    }

    #[tokio::test]
    async fn test_fractional_value_is_only_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ingestor) = ingestor(&dir).await;

        let outcome = ingestor
            .ingest(Event::new("frontend_route_change").value(2.5).label("path", "/"))
            .await
            .unwrap();

        assert!(!outcome.counted);
        assert!(!registry.render().contains("frontend_route_change_total{"));
        assert_eq!(lines(&dir), 1);
    }

    #[tokio::test]
    async fn test_missing_label_is_only_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ingestor) = ingestor(&dir).await;

        let outcome = ingestor
            .ingest(Event::new("frontend_route_change").label("route", "/"))
            .await
            .unwrap();

        assert!(!outcome.counted);
        assert!(!registry.render().contains("frontend_route_change_total{"));
        assert_eq!(lines(&dir), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_increment() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CounterRegistry::new().unwrap();
        let sink = LogSink::open(dir.path().join("gone/events.log")).await.unwrap();
        let ingestor =
            Ingestor::new(&registry, &Configuration::default().metrics, sink).unwrap();
        std::fs::remove_dir_all(dir.path().join("gone")).unwrap();

        let result = ingestor
            .ingest(Event::new("frontend_route_change").label("path", "/"))
            .await;

        assert!(result.is_err());
        assert!(registry
            .render()
            .contains(r#"frontend_route_change_total{path="/"} 1"#));
    }
}

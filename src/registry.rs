//! Process-wide counter registry rendered in the Prometheus text format.
//!
//! The registry owns a dedicated Prometheus recorder instead of installing a
//! global one, so every [`CounterRegistry`] is an isolated set of metrics.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, RwLock};

use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, Unit};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};
use regex_lite::Regex;

/// Content type of [`CounterRegistry::render`].
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub const HTTP_REQUESTS_DURATION: &str = "http_requests_duration_seconds";

static METRIC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap());
static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

/// Errors raised while declaring or incrementing counters.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("invalid metric name `{0}`")]
    InvalidName(String),
    #[error("invalid label name `{0}`")]
    InvalidLabel(String),
    #[error("counter `{name}` already registered with labels {existing:?}")]
    Conflict { name: String, existing: Vec<String> },
    #[error("counter `{name}` requires label `{label}`")]
    MissingLabel { name: String, label: String },
    #[error("counter `{name}` cannot grow past u64::MAX")]
    Overflow { name: String },
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

struct Inner {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    /// Declared label names per counter.
    counters: RwLock<HashMap<String, Arc<[String]>>>,
    /// Totals of declared counters per series. The recorder wraps on
    /// overflow, so headroom is checked here first.
    totals: Mutex<HashMap<Key, u64>>,
}

/// Set of named counters with fixed label dimensions.
#[derive(Clone)]
pub struct CounterRegistry {
    inner: Arc<Inner>,
}

impl CounterRegistry {
    /// Create an empty registry.
    pub fn new() -> Result<Self, BuildError> {
        const EXPONENTIAL_SECONDS: &[f64] = &[
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ];

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(HTTP_REQUESTS_DURATION.to_string()),
                EXPONENTIAL_SECONDS,
            )?
            .build_recorder();
        let handle = recorder.handle();

        Ok(Self {
            inner: Arc::new(Inner {
                recorder,
                handle,
                counters: RwLock::new(HashMap::new()),
                totals: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Declare a counter.
    ///
    /// Declaring the same name twice with the same labels returns the
    /// existing counter.
    pub fn register(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<Counter, RegistryError> {
        if !METRIC_NAME.is_match(name) {
            return Err(RegistryError::InvalidName(name.to_owned()));
        }
        if let Some(label) = label_names
            .iter()
            .find(|l| !LABEL_NAME.is_match(l) || l.starts_with("__"))
        {
            return Err(RegistryError::InvalidLabel((*label).to_owned()));
        }

        let mut counters = self
            .inner
            .counters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = counters.get(name) {
            return if existing.iter().map(String::as_str).eq(label_names.iter().copied()) {
                Ok(Counter {
                    name: Arc::from(name),
                    label_names: Arc::clone(existing),
                    registry: self.clone(),
                })
            } else {
                Err(RegistryError::Conflict {
                    name: name.to_owned(),
                    existing: existing.to_vec(),
                })
            };
        }

        self.inner.recorder.describe_counter(
            KeyName::from(name.to_owned()),
            None,
            help.to_owned().into(),
        );

        let counter = Counter {
            name: Arc::from(name),
            label_names: label_names.iter().map(|l| (*l).to_owned()).collect(),
            registry: self.clone(),
        };
        counters.insert(name.to_owned(), Arc::clone(&counter.label_names));

        tracing::debug!(counter = name, labels = ?label_names, "counter registered");

        Ok(counter)
    }

    /// Describe a gauge. Values are set with [`CounterRegistry::set_gauge`].
    pub fn describe_gauge(&self, name: &'static str, unit: Unit, help: &'static str) {
        self.inner
            .recorder
            .describe_gauge(KeyName::from(name), Some(unit), help.into());
    }

    pub fn set_gauge(&self, name: &'static str, value: f64) {
        self.inner
            .recorder
            .register_gauge(&Key::from_name(name), &metadata())
            .set(value);
    }

    /// Increment an undeclared counter, used for HTTP tracking.
    pub fn increment_raw(&self, name: &'static str, labels: &[(&'static str, String)], amount: u64) {
        self.inner
            .recorder
            .register_counter(&key(name, labels), &metadata())
            .increment(amount);
    }

    pub fn record_histogram(&self, name: &'static str, labels: &[(&'static str, String)], value: f64) {
        self.inner
            .recorder
            .register_histogram(&key(name, labels), &metadata())
            .record(value);
    }

    /// Serialize every metric in the text exposition format.
    pub fn render(&self) -> String {
        self.inner.handle.render()
    }
}

fn key(name: &'static str, labels: &[(&'static str, String)]) -> Key {
    let labels: Vec<Label> = labels
        .iter()
        .map(|(k, v)| Label::new(*k, v.clone()))
        .collect();
    Key::from_parts(name, labels)
}

/// A declared counter.
#[derive(Clone)]
pub struct Counter {
    name: Arc<str>,
    label_names: Arc<[String]>,
    registry: CounterRegistry,
}

impl Counter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Add `amount` to the total of the tuple formed by the declared labels.
    ///
    /// Keys of `labels` that are not declared are ignored. An increment that
    /// would overflow the total is refused and leaves it unchanged.
    pub fn increment(
        &self,
        labels: &HashMap<String, String>,
        amount: u64,
    ) -> Result<(), RegistryError> {
        let labels = self
            .label_names
            .iter()
            .map(|name| match labels.get(name) {
                Some(value) => Ok(Label::new(name.clone(), value.clone())),
                None => Err(RegistryError::MissingLabel {
                    name: self.name.to_string(),
                    label: name.clone(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let key = Key::from_parts(self.name.to_string(), labels);
        let inner = &self.registry.inner;

        let mut totals = inner
            .totals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let total = totals.entry(key.clone()).or_default();
        *total = total
            .checked_add(amount)
            .ok_or_else(|| RegistryError::Overflow {
                name: self.name.to_string(),
            })?;

        inner
            .recorder
            .register_counter(&key, &metadata())
            .increment(amount);

        Ok(())
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("name", &self.name)
            .field("label_names", &self.label_names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_increment_renders_total() {
        let registry = CounterRegistry::new().unwrap();
        let counter = registry
            .register("frontend_route_change_total", "Total route changes in frontend", &["path"])
            .unwrap();

        counter.increment(&labels(&[("path", "/login")]), 1).unwrap();
        counter.increment(&labels(&[("path", "/login")]), 2).unwrap();
        counter.increment(&labels(&[("path", "/home")]), 1).unwrap();

        let output = registry.render();
        assert!(output.contains("# TYPE frontend_route_change_total counter"));
        assert!(output.contains("# HELP frontend_route_change_total Total route changes in frontend"));
        assert!(output.contains(r#"frontend_route_change_total{path="/login"} 3"#));
        assert!(output.contains(r#"frontend_route_change_total{path="/home"} 1"#));
    }

    #[test]
    fn test_undeclared_labels_are_ignored() {
        let registry = CounterRegistry::new().unwrap();
        let counter = registry.register("clicks_total", "", &["button"]).unwrap();

        counter
            .increment(&labels(&[("button", "save"), ("user", "42")]), 1)
            .unwrap();

        let output = registry.render();
        assert!(output.contains(r#"clicks_total{button="save"} 1"#));
        assert!(!output.contains("user="));
    }

    #[test]
    fn test_missing_label() {
        let registry = CounterRegistry::new().unwrap();
        let counter = registry.register("clicks_total", "", &["button"]).unwrap();

        let err = counter.increment(&labels(&[("path", "/")]), 1).unwrap_err();
        assert_eq!(
            err,
            RegistryError::MissingLabel {
                name: "clicks_total".into(),
                label: "button".into()
            }
        );
        assert!(!registry.render().contains("clicks_total{"));
    }

    #[test]
    fn test_overflow_is_refused() {
        let registry = CounterRegistry::new().unwrap();
        let counter = registry.register("big_total", "", &["path"]).unwrap();
        let path = labels(&[("path", "/x")]);

        counter.increment(&path, 10_000_000_000_000_000_000).unwrap();
        assert_eq!(
            counter.increment(&path, 10_000_000_000_000_000_000).unwrap_err(),
            RegistryError::Overflow {
                name: "big_total".into()
            }
        );
        counter.increment(&path, 1).unwrap();

        assert!(registry
            .render()
            .contains(r#"big_total{path="/x"} 10000000000000000001"#));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = CounterRegistry::new().unwrap();
        let first = registry.register("a_total", "", &["x"]).unwrap();
        let second = registry.register("a_total", "", &["x"]).unwrap();

        first.increment(&labels(&[("x", "1")]), 1).unwrap();
        second.increment(&labels(&[("x", "1")]), 1).unwrap();
        assert!(registry.render().contains(r#"a_total{x="1"} 2"#));

        assert!(matches!(
            registry.register("a_total", "", &["y"]),
            Err(RegistryError::Conflict { .. })
        ));
    }

    #[test]
    fn test_invalid_names() {
        let registry = CounterRegistry::new().unwrap();
        assert_eq!(
            registry.register("front-end", "", &[]).unwrap_err(),
            RegistryError::InvalidName("front-end".into())
        );
        assert_eq!(
            registry.register("ok_total", "", &["__reserved"]).unwrap_err(),
            RegistryError::InvalidLabel("__reserved".into())
        );
    }

    #[test]
    fn test_registries_are_isolated() {
        let first = CounterRegistry::new().unwrap();
        let second = CounterRegistry::new().unwrap();
        first
            .register("only_here_total", "", &[])
            .unwrap()
            .increment(&HashMap::new(), 1)
            .unwrap();

        assert!(first.render().contains("only_here_total 1"));
        assert!(!second.render().contains("only_here_total"));
    }

    #[test]
    fn test_concurrent_increments() {
        let registry = CounterRegistry::new().unwrap();
        let counter = registry.register("hits_total", "", &["path"]).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..125 {
                        counter.increment(&labels(&[("path", "/")]), 1).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(registry.render().contains(r#"hits_total{path="/"} 1000"#));
    }
}

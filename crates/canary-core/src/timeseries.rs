//! The time-series data model and the reader capability the predicate
//! evaluator consumes.
//!
//! Envelopes mirror the metric store's wire shape: a tenancy `source_id`, a
//! nanosecond timestamp, a tag map, and at most one typed payload (counter,
//! gauge, or timer). Int64 fields tolerate the store's protojson habit of
//! encoding 64-bit integers as strings, and envelope kinds this router does
//! not consume (logs and the like) decode to an empty payload instead of
//! failing the whole batch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a [`MetricReader`].
#[derive(Debug, Error)]
pub enum ReadError {
    /// The backend could not be reached or the request failed in transit.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with an unexpected HTTP status.
    #[error("unexpected status {0}")]
    Status(u16),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// One sample from the time-series source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EnvelopeWire", into = "EnvelopeWire")]
pub struct Envelope {
    /// Tenancy label of the series this envelope belongs to.
    pub source_id: String,

    /// Sample instant in nanoseconds since the Unix epoch.
    pub timestamp: i64,

    /// Free-form tags attached by the emitter.
    pub tags: BTreeMap<String, String>,

    /// The typed payload; `None` for envelope kinds this router ignores.
    pub payload: Option<Payload>,
}

/// The typed portion of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A monotonically increasing count.
    Counter(Counter),

    /// A set of named point-in-time values.
    Gauge(Gauge),

    /// A named span of time; carries no numeric value.
    Timer(Timer),
}

/// Counter payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Metric name.
    pub name: String,

    /// Cumulative total.
    #[serde(default, with = "int64_compat")]
    pub total: i64,
}

/// Gauge payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gauge {
    /// Values keyed by metric name.
    #[serde(default)]
    pub metrics: BTreeMap<String, GaugeValue>,
}

/// A single gauge reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    /// The reading.
    #[serde(default)]
    pub value: f64,
}

/// Timer payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    /// Metric name.
    pub name: String,
}

impl Envelope {
    /// Creates a counter envelope.
    #[must_use]
    pub fn counter(
        source_id: impl Into<String>,
        timestamp: i64,
        name: impl Into<String>,
        total: i64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            tags: BTreeMap::new(),
            payload: Some(Payload::Counter(Counter {
                name: name.into(),
                total,
            })),
        }
    }

    /// Creates a single-value gauge envelope.
    #[must_use]
    pub fn gauge(
        source_id: impl Into<String>,
        timestamp: i64,
        name: impl Into<String>,
        value: f64,
    ) -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert(name.into(), GaugeValue { value });
        Self {
            source_id: source_id.into(),
            timestamp,
            tags: BTreeMap::new(),
            payload: Some(Payload::Gauge(Gauge { metrics })),
        }
    }

    /// Creates a timer envelope.
    #[must_use]
    pub fn timer(source_id: impl Into<String>, timestamp: i64, name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            tags: BTreeMap::new(),
            payload: Some(Payload::Timer(Timer { name: name.into() })),
        }
    }

    /// Adds a tag, consuming and returning the envelope.
    #[must_use]
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Whether this envelope carries the named metric.
    #[must_use]
    pub fn carries_metric(&self, name: &str) -> bool {
        match &self.payload {
            Some(Payload::Counter(c)) => c.name == name,
            Some(Payload::Timer(t)) => t.name == name,
            Some(Payload::Gauge(g)) => g.metrics.contains_key(name),
            None => false,
        }
    }

    /// The numeric value this envelope contributes for the named metric.
    ///
    /// Counters contribute their cumulative total and gauges the value keyed
    /// by the metric name. Timers carry no numeric value and sample as zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn metric_value(&self, name: &str) -> f64 {
        match &self.payload {
            Some(Payload::Counter(c)) if c.name == name => c.total as f64,
            Some(Payload::Gauge(g)) => g.metrics.get(name).map_or(0.0, |v| v.value),
            _ => 0.0,
        }
    }
}

/// Options for a [`MetricReader::read`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Upper bound on sample time; unbounded when `None`.
    pub end_time: Option<DateTime<Utc>>,
}

/// Capability to read envelopes for one source over a time window.
#[async_trait]
pub trait MetricReader: Send + Sync {
    /// Reads envelopes for `source_id` from `start` up to
    /// `options.end_time`.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] when the backend cannot be reached or its
    /// response cannot be decoded. An empty result is not an error.
    async fn read(
        &self,
        source_id: &str,
        start: DateTime<Utc>,
        options: ReadOptions,
    ) -> Result<Vec<Envelope>, ReadError>;
}

/// Wire shape of an envelope: the payload oneof is flattened into optional
/// sibling fields, the way the store's protojson renders it.
#[derive(Serialize, Deserialize)]
struct EnvelopeWire {
    #[serde(default)]
    source_id: String,

    #[serde(default, with = "int64_compat")]
    timestamp: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    counter: Option<Counter>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    gauge: Option<Gauge>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    timer: Option<Timer>,
}

impl From<EnvelopeWire> for Envelope {
    fn from(wire: EnvelopeWire) -> Self {
        let payload = if let Some(counter) = wire.counter {
            Some(Payload::Counter(counter))
        } else if let Some(gauge) = wire.gauge {
            Some(Payload::Gauge(gauge))
        } else {
            wire.timer.map(Payload::Timer)
        };

        Self {
            source_id: wire.source_id,
            timestamp: wire.timestamp,
            tags: wire.tags,
            payload,
        }
    }
}

impl From<Envelope> for EnvelopeWire {
    fn from(envelope: Envelope) -> Self {
        let mut wire = Self {
            source_id: envelope.source_id,
            timestamp: envelope.timestamp,
            tags: envelope.tags,
            counter: None,
            gauge: None,
            timer: None,
        };
        match envelope.payload {
            Some(Payload::Counter(counter)) => wire.counter = Some(counter),
            Some(Payload::Gauge(gauge)) => wire.gauge = Some(gauge),
            Some(Payload::Timer(timer)) => wire.timer = Some(timer),
            None => {}
        }
        wire
    }
}

mod int64_compat {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(*value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Int64Visitor;

        impl Visitor<'_> for Int64Visitor {
            type Value = i64;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("an int64, possibly encoded as a string")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<i64, E> {
                Ok(value)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<i64, E> {
                i64::try_from(value).map_err(|_| E::custom("value exceeds int64"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<i64, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Int64Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_protojson_string_integers() {
        let envelope: Envelope = serde_json::from_str(
            r#"{
                "source_id": "app-1",
                "timestamp": "1700000000000000000",
                "tags": {"deployment": "prod"},
                "counter": {"name": "requests", "total": "99"}
            }"#,
        )
        .unwrap();

        assert_eq!(envelope.timestamp, 1_700_000_000_000_000_000);
        assert_eq!(envelope.tags.get("deployment").unwrap(), "prod");
        assert_eq!(
            envelope.payload,
            Some(Payload::Counter(Counter {
                name: "requests".to_string(),
                total: 99,
            }))
        );
    }

    #[test]
    fn test_decodes_numeric_integers() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"source_id": "a", "timestamp": 12, "counter": {"name": "m", "total": 3}}"#,
        )
        .unwrap();
        assert_eq!(envelope.timestamp, 12);
    }

    #[test]
    fn test_tolerates_foreign_payload_kinds() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"source_id": "a", "timestamp": 1, "log": {"payload": "aGk="}}"#,
        )
        .unwrap();
        assert_eq!(envelope.payload, None);
        assert!(!envelope.carries_metric("m"));
    }

    #[test]
    fn test_metric_matching_and_values() {
        let counter = Envelope::counter("a", 1, "hits", 42);
        assert!(counter.carries_metric("hits"));
        assert!(!counter.carries_metric("misses"));
        assert!((counter.metric_value("hits") - 42.0).abs() < f64::EPSILON);

        let gauge = Envelope::gauge("a", 1, "load", 1.5);
        assert!(gauge.carries_metric("load"));
        assert!((gauge.metric_value("load") - 1.5).abs() < f64::EPSILON);

        let timer = Envelope::timer("a", 1, "latency");
        assert!(timer.carries_metric("latency"));
        assert!((timer.metric_value("latency")).abs() < f64::EPSILON);
    }
}

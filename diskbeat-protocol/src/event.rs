//! Telemetry events carried on the reporting connection
//!
//! One event is one JSON object with a single key:
//! - `{"<probe>": {"operation_time": 1.2, "file_size": 20000000, "chunk_size": 10000000, "write_speed": "..."}}`
//! - `{"<probe>_Performance": {"cpu": "3.1", "mem": "0.4"}}`

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Key suffix marking a resource-usage event
pub const PERFORMANCE_SUFFIX: &str = "_Performance";

/// Longest probe identity in bytes accepted by [`TelemetryEvent::validate`].
/// Escaped identities double as record file names, which the filesystem caps.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Errors raised while turning bytes into a [`TelemetryEvent`]
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected event shape: {0}")]
    Shape(String),
    #[error("invalid {kind} payload for '{key}': {source}")]
    Payload {
        key: String,
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("probe identity is empty")]
    EmptyIdentity,
    #[error("invalid event: {0}")]
    Invalid(String),
}

/// One completed write measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds spent writing the file
    pub operation_time: f64,
    /// Bytes written in this iteration
    pub file_size: u64,
    pub chunk_size: u64,
    /// Human readable throughput, e.g. `8000000bytes/sec`
    pub write_speed: String,
}

/// CPU and memory usage of the probe, as percentages rendered to text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cpu: String,
    pub mem: String,
}

/// Body of a telemetry event, stored verbatim in the probe record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Sample(Sample),
    Resource(Resource),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Sample(_) => "sample",
            Payload::Resource(_) => "resource",
        }
    }

    /// JSON object as persisted by the collector
    pub fn to_value(&self) -> Value {
        // Both variants are plain structs of strings and numbers
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A payload tagged with the probe identity that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    probe_id: String,
    payload: Payload,
}

impl TelemetryEvent {
    pub fn sample(probe_id: impl Into<String>, sample: Sample) -> Self {
        Self {
            probe_id: probe_id.into(),
            payload: Payload::Sample(sample),
        }
    }

    pub fn resource(probe_id: impl Into<String>, resource: Resource) -> Self {
        Self {
            probe_id: probe_id.into(),
            payload: Payload::Resource(resource),
        }
    }

    pub fn probe_id(&self) -> &str {
        &self.probe_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Payload) {
        (self.probe_id, self.payload)
    }

    fn wire_key(&self) -> String {
        match self.payload {
            Payload::Sample(_) => self.probe_id.clone(),
            Payload::Resource(_) => format!("{}{}", self.probe_id, PERFORMANCE_SUFFIX),
        }
    }

    /// Decode one event from raw frame bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json(value)
    }

    /// Decode one event from an already parsed JSON value.
    ///
    /// The payload shape decides the variant: a `_Performance` key whose body
    /// carries `cpu` is a resource event, everything else must be a sample.
    pub fn from_json(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(map) = value else {
            return Err(DecodeError::Shape("expected a JSON object".into()));
        };
        if map.len() != 1 {
            return Err(DecodeError::Shape(format!(
                "expected exactly one key, found {}",
                map.len()
            )));
        }
        let Some((key, body)) = map.into_iter().next() else {
            return Err(DecodeError::Shape("empty object".into()));
        };
        if !body.is_object() {
            return Err(DecodeError::Shape(format!("body of '{key}' is not an object")));
        }

        let event = match key.strip_suffix(PERFORMANCE_SUFFIX) {
            Some(probe_id) if body.get("cpu").is_some() => {
                let resource: Resource = serde_json::from_value(body).map_err(|source| {
                    DecodeError::Payload {
                        key: key.clone(),
                        kind: "resource",
                        source,
                    }
                })?;
                Self::resource(probe_id, resource)
            }
            _ => {
                let sample: Sample =
                    serde_json::from_value(body).map_err(|source| DecodeError::Payload {
                        key: key.clone(),
                        kind: "sample",
                        source,
                    })?;
                Self::sample(key, sample)
            }
        };

        if event.probe_id.is_empty() {
            return Err(DecodeError::EmptyIdentity);
        }
        Ok(event)
    }

    /// Semantic checks applied by the collector before anything is persisted
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.probe_id.trim().is_empty() {
            return Err(DecodeError::EmptyIdentity);
        }
        if self.probe_id.len() > MAX_IDENTITY_LEN {
            return Err(DecodeError::Invalid(format!(
                "probe identity is {} bytes, limit is {}",
                self.probe_id.len(),
                MAX_IDENTITY_LEN
            )));
        }
        if self.probe_id.chars().any(char::is_control) {
            return Err(DecodeError::Invalid(
                "probe identity contains control characters".into(),
            ));
        }
        if let Payload::Sample(sample) = &self.payload {
            if !sample.operation_time.is_finite() || sample.operation_time < 0.0 {
                return Err(DecodeError::Invalid(format!(
                    "operation_time {} is not a duration",
                    sample.operation_time
                )));
            }
            if sample.chunk_size == 0 {
                return Err(DecodeError::Invalid("chunk_size is zero".into()));
            }
        }
        Ok(())
    }

    /// `{ key: payload }` as a JSON value
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(1);
        map.insert(self.wire_key(), self.payload.to_value());
        Value::Object(map)
    }
}

impl Serialize for TelemetryEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.wire_key(), &self.payload)?;
        map.end()
    }
}

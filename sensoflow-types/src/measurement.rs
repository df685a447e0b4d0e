//! Measurements - immutable, timestamped payloads tagged with their pair.

use alloc::string::String;
use alloc::vec::Vec;

use crate::{AttributeId, PairKey, SensorId};

/// The value carried by a measurement.
///
/// Numeric payloads feed the adaptive controllers and the synchrony
/// computer; text payloads are routed but otherwise opaque.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Payload {
    /// A single scalar reading (temperature, heart rate, ...).
    Number(f64),
    /// A burst of samples (ECG strip, accelerometer window, pose vector).
    Vector(Vec<f64>),
    /// Anything else, passed through untouched.
    Text(String),
}

impl Payload {
    /// Numeric samples contained in this payload, if any.
    pub fn values(&self) -> &[f64] {
        match self {
            Payload::Number(value) => core::slice::from_ref(value),
            Payload::Vector(values) => values,
            Payload::Text(_) => &[],
        }
    }

    /// The most recent numeric sample.
    pub fn last_value(&self) -> Option<f64> {
        self.values().last().copied()
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Number(value)
    }
}

impl From<Vec<f64>> for Payload {
    fn from(values: Vec<f64>) -> Self {
        Payload::Vector(values)
    }
}

/// A single sensor measurement.
///
/// Measurements are never mutated once created; the pipeline shares them
/// behind `Arc` while appending, evicting or forwarding.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Measurement {
    /// The sensor that produced this measurement.
    pub sensor_id: SensorId,

    /// The attribute identifier (e.g., "heart_rate", "temperature").
    pub attribute_id: AttributeId,

    /// The measurement payload.
    pub payload: Payload,

    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl Measurement {
    /// Create a measurement stamped with the current time.
    #[cfg(feature = "std")]
    pub fn new(
        sensor_id: impl Into<SensorId>,
        attribute_id: impl Into<AttributeId>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self::with_timestamp(sensor_id, attribute_id, payload, crate::current_timestamp_ms())
    }

    /// Create a measurement with a specific timestamp.
    pub fn with_timestamp(
        sensor_id: impl Into<SensorId>,
        attribute_id: impl Into<AttributeId>,
        payload: impl Into<Payload>,
        timestamp: i64,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            attribute_id: attribute_id.into(),
            payload: payload.into(),
            timestamp,
        }
    }

    /// The `(sensor, attribute)` pair this measurement belongs to.
    pub fn key(&self) -> PairKey {
        PairKey {
            sensor_id: self.sensor_id.clone(),
            attribute_id: self.attribute_id.clone(),
        }
    }

    /// Numeric samples contained in the payload.
    pub fn values(&self) -> &[f64] {
        self.payload.values()
    }
}

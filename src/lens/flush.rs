//! Outbound flush batches.

use std::sync::Arc;

use sensoflow_types::{ConsumerId, Measurement};
use serde::Serialize;

use super::QualityTier;

/// One batch delivered to a consumer.
///
/// Measurements appear in the order they were written to the buffer.
///
/// ```json
/// {
///   "consumer_id": 3,
///   "sequence": 17,
///   "tier": "smooth",
///   "timestamp": 1703160000000,
///   "measurements": [
///     {"sensor_id": "s1", "attribute_id": "hr", "payload": 72.0, "timestamp": 1703159999990}
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flush {
    pub consumer_id: ConsumerId,
    /// Increments by one for every flush delivered to this consumer.
    pub sequence: u64,
    pub tier: QualityTier,
    pub timestamp: i64,
    pub measurements: Vec<Arc<Measurement>>,
}

impl Flush {
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let flush = Flush {
            consumer_id: ConsumerId(3),
            sequence: 17,
            tier: QualityTier::Smooth,
            timestamp: 1_703_160_000_000,
            measurements: vec![Arc::new(Measurement::with_timestamp(
                "s1",
                "hr",
                72.0,
                1_703_159_999_990,
            ))],
        };

        let value: serde_json::Value = serde_json::from_str(&flush.to_json().unwrap()).unwrap();
        assert_eq!(value["consumer_id"], 3);
        assert_eq!(value["sequence"], 17);
        assert_eq!(value["tier"], "smooth");
        assert_eq!(value["measurements"][0]["sensor_id"], "s1");
        assert_eq!(value["measurements"][0]["payload"], 72.0);
    }
}

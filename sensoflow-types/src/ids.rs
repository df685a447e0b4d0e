//! Identifiers for sensors, attributes, consumers and connections.

use alloc::string::String;
use core::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.into())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable identifier of an external data source.
    SensorId
);

string_id!(
    /// Name of a data channel owned by a sensor (e.g. `heart_rate`).
    AttributeId
);

/// A `(sensor, attribute)` pair - the unit of attention and storage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PairKey {
    pub sensor_id: SensorId,
    pub attribute_id: AttributeId,
}

impl PairKey {
    pub fn new(sensor_id: impl Into<SensorId>, attribute_id: impl Into<AttributeId>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            attribute_id: attribute_id.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sensor_id, self.attribute_id)
    }
}

/// Opaque handle for a connected consumer's buffer.
///
/// Handles are plain integers so consumer churn never grows an
/// identifier table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// Opaque handle for a viewer connection that owns attention views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl From<ConsumerId> for ConnectionId {
    fn from(id: ConsumerId) -> Self {
        ConnectionId(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn pair_key_display() {
        let key = PairKey::new("s1", "temp");
        assert_eq!(key.to_string(), "s1/temp");
    }

    #[test]
    fn pair_keys_order_by_sensor_then_attribute() {
        let a = PairKey::new("s1", "b");
        let b = PairKey::new("s1", "c");
        let c = PairKey::new("s2", "a");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn consumer_id_converts_to_connection() {
        let conn: ConnectionId = ConsumerId(7).into();
        assert_eq!(conn, ConnectionId(7));
    }
}

//! Millisecond windows.
//!
//! Delivery windows and flush periods are exchanged as whole milliseconds,
//! which is what producers schedule against.

use core::time::Duration;

/// A window length in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Millis(pub u64);

impl Millis {
    /// Create from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Create from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Round a floating-point millisecond value, saturating at zero.
    pub fn from_f64(millis: f64) -> Self {
        if millis.is_finite() && millis > 0.0 {
            Self(millis.round() as u64)
        } else {
            Self(0)
        }
    }

    /// Get the value in milliseconds.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get the value as a float, for multiplier arithmetic.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }

    /// Convert to a standard Duration.
    pub const fn to_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Clamp into an inclusive range.
    pub fn clamp_to(self, min: Millis, max: Millis) -> Self {
        Self(self.0.clamp(min.0, max.0.max(min.0)))
    }
}

impl From<Duration> for Millis {
    fn from(d: Duration) -> Self {
        Self(d.as_millis() as u64)
    }
}

impl From<Millis> for Duration {
    fn from(m: Millis) -> Self {
        Duration::from_millis(m.0)
    }
}

//! Settable signal source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{clamp_pressure, SignalError, SignalSource};

/// Sentinel bit pattern meaning "no value".
const UNAVAILABLE: u64 = u64::MAX;

/// A signal whose value is pushed in from elsewhere.
///
/// Clones share the same value, so one clone can be handed to the sampler
/// while another is updated by whatever measures the pressure (the consumer
/// lens updates its queue pressure this way).
#[derive(Debug, Clone)]
pub struct FixedSignal {
    name: Arc<str>,
    bits: Arc<AtomicU64>,
}

impl FixedSignal {
    /// Create a signal with an initial pressure.
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: Arc::from(name),
            bits: Arc::new(AtomicU64::new(clamp_pressure(value).to_bits())),
        }
    }

    /// Create a signal that reports unavailable until first set.
    pub fn unavailable(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            bits: Arc::new(AtomicU64::new(UNAVAILABLE)),
        }
    }

    /// Update the pressure.
    pub fn set(&self, value: f64) {
        self.bits
            .store(clamp_pressure(value).to_bits(), Ordering::Relaxed);
    }

    /// Mark the signal unavailable.
    pub fn clear(&self) {
        self.bits.store(UNAVAILABLE, Ordering::Relaxed);
    }
}

impl SignalSource for FixedSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&self) -> Result<f64, SignalError> {
        match self.bits.load(Ordering::Relaxed) {
            UNAVAILABLE => Err(SignalError::Unavailable(format!("{} not set", self.name))),
            bits => Ok(f64::from_bits(bits)),
        }
    }
}

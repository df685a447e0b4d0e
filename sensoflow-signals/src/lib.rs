//! # sensoflow-signals
//!
//! Load signal sources for the sensoflow load sampler.
//!
//! Every source reports a *pressure* in `[0.0, 1.0]`, where `0.0` means idle
//! and `1.0` means saturated. The sampler blends several of them into a
//! single load level.
//!
//! ## Provided Sources
//!
//! - **CPU** (`procfs` feature) - busy fraction from `/proc/stat` deltas
//! - **Memory** (`procfs` feature) - `1 - MemAvailable / MemTotal` from `/proc/meminfo`
//! - **Run queue** (`procfs` feature) - 1-minute load average per core from `/proc/loadavg`
//! - **Fixed** - a settable value, for embedding custom measurements and for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use sensoflow_signals::{FixedSignal, SignalSource};
//!
//! let queue = FixedSignal::new("queue", 0.25);
//! assert_eq!(queue.sample().unwrap(), 0.25);
//!
//! queue.set(0.9);
//! assert_eq!(queue.sample().unwrap(), 0.9);
//! ```

use std::fmt::Debug;

pub mod error;
mod fixed;

#[cfg(feature = "procfs")]
pub mod procfs;

pub use error::SignalError;
pub use fixed::FixedSignal;

#[cfg(feature = "procfs")]
pub use procfs::{ProcCpu, ProcMemory, ProcRunQueue};

/// A source of one load pressure signal.
///
/// Implementations must be cheap to call from a periodic sampler and must
/// never block for long; a failed sample is reported as an error and the
/// caller decides what to substitute.
pub trait SignalSource: Send + Sync + Debug {
    /// Short name used in logs (e.g. "cpu").
    fn name(&self) -> &str;

    /// Sample the current pressure in `[0.0, 1.0]`.
    fn sample(&self) -> Result<f64, SignalError>;
}

/// Clamp a raw ratio into the pressure range, mapping non-finite values to idle.
pub fn clamp_pressure(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

//! Phase synchrony across a group of sensors.
//!
//! Each tracked sensor keeps a rolling window of recent values. The newest
//! value is mapped onto a phase angle from its position inside the window's
//! range and its direction of travel:
//!
//! ```text
//! x = (v - min) / (max - min)
//! θ = acos(2x - 1)          falling
//! θ = 2π - acos(2x - 1)     rising
//! ```
//!
//! The Kuramoto order parameter `R = |mean(e^{iθ})|` is 1.0 when every
//! sensor is at the same point of its cycle and close to 0.0 when phases are
//! spread out. A flat window has no phase and is left out.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::TAU;
use std::sync::Arc;

use parking_lot::Mutex;
use sensoflow_types::{AttributeId, Measurement, SensorId};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::SynchronyConfig;

/// Sensors whose values of one attribute are compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronyGroup {
    pub sensors: Vec<SensorId>,
    pub attribute: AttributeId,
}

impl SynchronyGroup {
    pub fn new<S: Into<SensorId>>(
        sensors: impl IntoIterator<Item = S>,
        attribute: impl Into<AttributeId>,
    ) -> Self {
        Self {
            sensors: sensors.into_iter().map(Into::into).collect(),
            attribute: attribute.into(),
        }
    }

    pub fn contains(&self, measurement: &Measurement) -> bool {
        measurement.attribute_id == self.attribute && self.sensors.contains(&measurement.sensor_id)
    }
}

/// Latest synchrony estimate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SynchronyReading {
    /// Order parameter of the most recent update.
    pub r: f64,
    /// Exponentially smoothed order parameter.
    pub smoothed: f64,
    /// Sensors with a defined phase in the most recent update.
    pub sensors: usize,
    pub timestamp: i64,
}

/// Phase of the newest value in `window`, or `None` if the window is flat
/// or too short.
pub fn phase(window: &VecDeque<f64>, flat_epsilon: f64) -> Option<f64> {
    let len = window.len();
    if len < 2 {
        return None;
    }
    let (min, max) = window
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if !(max - min).is_finite() || max - min < flat_epsilon {
        return None;
    }

    let current = window[len - 1];
    let x = (current - min) / (max - min);
    let angle = (2.0 * x - 1.0).clamp(-1.0, 1.0).acos();
    if current > window[len - 2] {
        Some(TAU - angle)
    } else {
        Some(angle)
    }
}

/// `|mean(e^{iθ})|`, or `None` with fewer than two phases.
pub fn order_parameter(phases: &[f64]) -> Option<f64> {
    if phases.len() < 2 {
        return None;
    }
    let n = phases.len() as f64;
    let (re, im) = phases
        .iter()
        .fold((0.0, 0.0), |(re, im), theta| (re + theta.cos(), im + theta.sin()));
    Some(((re / n).powi(2) + (im / n).powi(2)).sqrt())
}

/// Tracks one group and publishes its synchrony on a `watch` channel.
#[derive(Debug)]
pub struct SynchronyComputer {
    group: SynchronyGroup,
    config: SynchronyConfig,
    windows: Mutex<HashMap<SensorId, VecDeque<f64>>>,
    tx: watch::Sender<SynchronyReading>,
}

impl SynchronyComputer {
    pub fn new(group: SynchronyGroup, config: SynchronyConfig) -> Self {
        let (tx, _) = watch::channel(SynchronyReading::default());
        Self {
            group,
            config,
            windows: Mutex::new(HashMap::new()),
            tx,
        }
    }

    pub fn group(&self) -> &SynchronyGroup {
        &self.group
    }

    pub fn subscribe(&self) -> watch::Receiver<SynchronyReading> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SynchronyReading {
        *self.tx.borrow()
    }

    /// Feed one measurement; returns the new reading if one was published.
    pub fn observe(&self, measurement: &Measurement) -> Option<SynchronyReading> {
        if !self.group.contains(measurement) || measurement.values().is_empty() {
            return None;
        }

        let phases: Vec<f64> = {
            let mut windows = self.windows.lock();
            let window = windows.entry(measurement.sensor_id.clone()).or_default();
            for value in measurement.values().iter().filter(|v| v.is_finite()) {
                window.push_back(*value);
            }
            while window.len() > self.config.window.max(2) {
                window.pop_front();
            }
            windows
                .values()
                .filter_map(|w| phase(w, self.config.flat_epsilon))
                .collect()
        };

        let r = order_parameter(&phases)?;
        let previous = self.current().smoothed;
        let reading = SynchronyReading {
            r,
            smoothed: self.config.smoothing * previous + (1.0 - self.config.smoothing) * r,
            sensors: phases.len(),
            timestamp: measurement.timestamp,
        };
        self.tx.send_replace(reading);
        Some(reading)
    }

    /// Drop a sensor's window.
    pub fn forget_sensor(&self, sensor: &SensorId) {
        self.windows.lock().remove(sensor);
    }

    /// Consume the raw stream until it closes or `stop` is set.
    pub async fn run(
        self: Arc<Self>,
        mut raw: broadcast::Receiver<Arc<Measurement>>,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!(
            sensors = self.group.sensors.len(),
            attribute = %self.group.attribute,
            "Tracking synchrony"
        );
        loop {
            tokio::select! {
                received = raw.recv() => match received {
                    Ok(measurement) => {
                        self.observe(&measurement);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, attribute = %self.group.attribute, "Synchrony lagged behind raw stream");
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

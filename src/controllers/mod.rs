//! Adaptive controllers.
//!
//! Each controller contributes a multiplicative factor to a pair's delivery
//! window: below `1.0` speeds delivery up, above `1.0` slows it down.
//! Controllers are independent of each other. They see the pipeline only
//! through [`TickContext`] and whatever inputs the pipeline pushes into
//! them, and any failure degrades to a neutral `1.0`.
//!
//! | Controller | Reacts to |
//! |---|---|
//! | [`NoveltyDetector`] | statistically unusual measurements |
//! | [`ResourceArbiter`] | relative priority of all watched pairs |
//! | [`HomeostaticController`] | time spent at each load level |
//! | [`CircadianScheduler`] | the daily load profile |
//! | [`PredictiveBalancer`] | periodic attention patterns |

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use sensoflow_types::{AttentionLevel, PairKey, SensorId};
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::sampler::LoadSample;

pub mod arbiter;
pub mod circadian;
pub mod homeostatic;
pub mod novelty;
pub mod predictive;

pub use arbiter::ResourceArbiter;
pub use circadian::CircadianScheduler;
pub use homeostatic::HomeostaticController;
pub use novelty::NoveltyDetector;
pub use predictive::PredictiveBalancer;

/// What a controller sees on each periodic tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub now: Instant,
    /// Wall clock time in Unix milliseconds.
    pub wall_clock_ms: i64,
    pub load: &'a LoadSample,
    /// Aggregate attention of every pair above `None`.
    pub attention: &'a BTreeMap<PairKey, AttentionLevel>,
}

/// A source of delivery-window adjustments.
pub trait Controller: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Multiplier for `key` at `now`.
    fn factor(&self, key: &PairKey, now: Instant) -> Result<f64, ControllerError>;

    /// Periodic update.
    fn tick(&self, _ctx: &TickContext<'_>) -> Result<(), ControllerError> {
        Ok(())
    }

    /// Drop any per-pair state for a sensor.
    fn forget_sensor(&self, _sensor: &SensorId) {}
}

/// Validate a raw factor and clamp it into `[min, max]`.
pub fn clamp_factor(
    name: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<f64, ControllerError> {
    if !value.is_finite() {
        return Err(ControllerError::NonFinite(name));
    }
    Ok(value.clamp(min, max))
}

/// The active controllers, composed by multiplication.
#[derive(Debug, Clone)]
pub struct ControllerSet {
    controllers: Vec<Arc<dyn Controller>>,
    min: f64,
    max: f64,
}

impl ControllerSet {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            controllers: Vec::new(),
            min,
            max,
        }
    }

    pub fn with(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn push(&mut self, controller: Arc<dyn Controller>) {
        self.controllers.push(controller);
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// Product of every controller's clamped factor, clamped again.
    pub fn factor(&self, key: &PairKey, now: Instant) -> f64 {
        let product = self
            .controllers
            .iter()
            .map(|controller| {
                let name = controller.name();
                match controller
                    .factor(key, now)
                    .and_then(|value| clamp_factor(name, value, self.min, self.max))
                {
                    Ok(value) => value,
                    Err(ControllerError::InsufficientData(reason)) => {
                        debug!(controller = name, pair = %key, %reason, "Controller has no data yet");
                        1.0
                    }
                    Err(e) => {
                        warn!(controller = name, pair = %key, error = %e, "Controller failed, using neutral factor");
                        1.0
                    }
                }
            })
            .product::<f64>();

        product.clamp(self.min, self.max)
    }

    pub fn tick(&self, ctx: &TickContext<'_>) {
        for controller in &self.controllers {
            if let Err(e) = controller.tick(ctx) {
                warn!(controller = controller.name(), error = %e, "Controller tick failed");
            }
        }
    }

    pub fn forget_sensor(&self, sensor: &SensorId) {
        for controller in &self.controllers {
            controller.forget_sensor(sensor);
        }
    }
}

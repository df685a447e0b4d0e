//! Homeostatic threshold tuning.
//!
//! Tracks how long the node spends at each load level. At the end of every
//! period the observed distribution is compared with a target (by default
//! 70% normal, 20% elevated, 8% high, 2% critical) and each load threshold
//! is nudged towards producing that distribution. The controller's factor
//! mildly slows delivery while the node spends more time stressed than the
//! target allows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sensoflow_types::{LoadLevel, PairKey};
use tracing::debug;

use super::{Controller, TickContext};
use crate::config::HomeostaticConfig;
use crate::error::ControllerError;
use crate::sampler::SharedThresholds;

const MIN_FACTOR: f64 = 0.8;
const MAX_FACTOR: f64 = 1.25;

#[derive(Debug)]
struct Tally {
    time_in: [Duration; 4],
    period_start: Option<Instant>,
    last_tick: Option<Instant>,
    factor: f64,
}

#[derive(Debug)]
pub struct HomeostaticController {
    config: HomeostaticConfig,
    thresholds: Arc<SharedThresholds>,
    tally: Mutex<Tally>,
}

impl HomeostaticController {
    pub fn new(config: HomeostaticConfig, thresholds: Arc<SharedThresholds>) -> Self {
        Self {
            config,
            thresholds,
            tally: Mutex::new(Tally {
                time_in: [Duration::ZERO; 4],
                period_start: None,
                last_tick: None,
                factor: 1.0,
            }),
        }
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.config.period_ms.max(1))
    }

    /// Share of time at or above each elevated level, given per-level shares.
    fn at_or_above(shares: [f64; 4]) -> [f64; 3] {
        [
            shares[1] + shares[2] + shares[3],
            shares[2] + shares[3],
            shares[3],
        ]
    }

    fn close_period(&self, tally: &mut Tally) {
        let total: f64 = tally.time_in.iter().map(Duration::as_secs_f64).sum();
        if total <= 0.0 {
            return;
        }

        let mut observed = [0.0; 4];
        for (share, time) in observed.iter_mut().zip(tally.time_in) {
            *share = time.as_secs_f64() / total;
        }

        let observed_above = Self::at_or_above(observed);
        let target_above = Self::at_or_above(self.config.target);
        let deltas: [f64; 3] =
            std::array::from_fn(|i| self.config.gain * (observed_above[i] - target_above[i]));
        let thresholds = self.thresholds.adjust(deltas);

        let excess = observed_above[1] - target_above[1];
        tally.factor = (1.0 + excess).clamp(MIN_FACTOR, MAX_FACTOR);

        debug!(
            observed = ?observed,
            elevated = thresholds.elevated,
            high = thresholds.high,
            critical = thresholds.critical,
            factor = tally.factor,
            "Homeostatic adjustment"
        );
        tally.time_in = [Duration::ZERO; 4];
    }
}

impl Controller for HomeostaticController {
    fn name(&self) -> &'static str {
        "homeostatic"
    }

    fn factor(&self, _key: &PairKey, _now: Instant) -> Result<f64, ControllerError> {
        Ok(self.tally.lock().factor)
    }

    fn tick(&self, ctx: &TickContext<'_>) -> Result<(), ControllerError> {
        let mut tally = self.tally.lock();
        let level: LoadLevel = ctx.load.level;

        if let Some(last) = tally.last_tick {
            let dt = ctx.now.saturating_duration_since(last);
            tally.time_in[level.index()] += dt;
        }
        tally.last_tick = Some(ctx.now);

        let start = *tally.period_start.get_or_insert(ctx.now);
        if ctx.now.saturating_duration_since(start) >= self.period() {
            self.close_period(&mut tally);
            tally.period_start = Some(ctx.now);
        }
        Ok(())
    }
}

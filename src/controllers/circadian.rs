//! Circadian load anticipation.
//!
//! Learns a 24-hour load profile (one exponentially weighted bucket per UTC
//! hour) and slows delivery slightly ahead of hours that are usually busier
//! than average, or speeds it up ahead of quiet ones.

use std::time::Instant;

use parking_lot::Mutex;
use sensoflow_types::PairKey;

use super::{Controller, TickContext};
use crate::config::CircadianConfig;
use crate::error::ControllerError;

const HOURS: usize = 24;
const MS_PER_HOUR: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HourBucket {
    pub mean: f64,
    pub observations: u64,
}

#[derive(Debug)]
struct Profile {
    buckets: [HourBucket; HOURS],
    /// `None` until the bucket being anticipated has enough observations.
    factor: Option<f64>,
}

#[derive(Debug)]
pub struct CircadianScheduler {
    config: CircadianConfig,
    profile: Mutex<Profile>,
}

/// UTC hour of a Unix millisecond timestamp.
pub fn hour_of(wall_clock_ms: i64) -> usize {
    wall_clock_ms.div_euclid(MS_PER_HOUR).rem_euclid(HOURS as i64) as usize
}

impl CircadianScheduler {
    pub fn new(config: CircadianConfig) -> Self {
        Self {
            config,
            profile: Mutex::new(Profile {
                buckets: [HourBucket::default(); HOURS],
                factor: None,
            }),
        }
    }

    pub fn bucket(&self, hour: usize) -> HourBucket {
        self.profile.lock().buckets[hour % HOURS]
    }

    /// Fold one load observation into the bucket for its hour.
    pub fn observe(&self, wall_clock_ms: i64, blend: f64) {
        if !blend.is_finite() {
            return;
        }
        let mut profile = self.profile.lock();
        let bucket = &mut profile.buckets[hour_of(wall_clock_ms)];
        bucket.mean = if bucket.observations == 0 {
            blend
        } else {
            (1.0 - self.config.alpha) * bucket.mean + self.config.alpha * blend
        };
        bucket.observations += 1;
    }

    /// Factor anticipating the load `lookahead` minutes after `wall_clock_ms`.
    pub fn anticipate(&self, wall_clock_ms: i64) -> Option<f64> {
        let profile = self.profile.lock();
        let lookahead_ms = self.config.lookahead_minutes as i64 * 60_000;
        let target = profile.buckets[hour_of(wall_clock_ms + lookahead_ms)];
        if target.observations < self.config.min_observations {
            return None;
        }

        let trained: Vec<f64> = profile
            .buckets
            .iter()
            .filter(|b| b.observations >= self.config.min_observations)
            .map(|b| b.mean)
            .collect();
        let profile_mean = trained.iter().sum::<f64>() / trained.len() as f64;

        let factor = 1.0 + self.config.sensitivity * (target.mean - profile_mean);
        Some(factor.clamp(self.config.min_factor, self.config.max_factor))
    }
}

impl Controller for CircadianScheduler {
    fn name(&self) -> &'static str {
        "circadian"
    }

    fn factor(&self, _key: &PairKey, _now: Instant) -> Result<f64, ControllerError> {
        self.profile
            .lock()
            .factor
            .ok_or_else(|| ControllerError::InsufficientData("daily profile still learning".to_string()))
    }

    fn tick(&self, ctx: &TickContext<'_>) -> Result<(), ControllerError> {
        self.observe(ctx.wall_clock_ms, ctx.load.blend);
        let factor = self.anticipate(ctx.wall_clock_ms);
        self.profile.lock().factor = factor;
        Ok(())
    }
}

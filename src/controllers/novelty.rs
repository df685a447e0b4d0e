//! Novelty detection.
//!
//! Keeps a running mean and variance per pair (Welford's algorithm). Once a
//! baseline has enough samples, a batch whose largest z-score exceeds the
//! threshold produces a single [`NoveltyEvent`] and speeds the pair up for a
//! while.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sensoflow_types::{PairKey, SensorId};

use super::Controller;
use crate::config::NoveltyConfig;
use crate::error::ControllerError;
use crate::events::NoveltyEvent;

const MIN_STD_DEV: f64 = 1e-9;

/// Running statistics for one pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Baseline {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl Baseline {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample standard deviation.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Distance from the mean in standard deviations, with the deviation
    /// never taken below `min_std_dev`.
    pub fn z_score(&self, value: f64, min_std_dev: f64) -> f64 {
        let deviation = (value - self.mean).abs();
        if deviation <= MIN_STD_DEV {
            0.0
        } else {
            deviation / self.std_dev().max(min_std_dev).max(MIN_STD_DEV)
        }
    }
}

#[derive(Debug, Default)]
struct PairState {
    baseline: Baseline,
    boost_until: Option<Instant>,
}

#[derive(Debug)]
pub struct NoveltyDetector {
    config: NoveltyConfig,
    pairs: DashMap<PairKey, PairState>,
}

impl NoveltyDetector {
    pub fn new(config: NoveltyConfig) -> Self {
        Self {
            config,
            pairs: DashMap::new(),
        }
    }

    /// Noise floor for a baseline centred on `mean`.
    fn std_dev_floor(&self, mean: f64) -> f64 {
        self.config
            .min_std_dev
            .max(self.config.min_relative_std_dev * mean.abs())
    }

    fn boost_duration(&self) -> Duration {
        Duration::from_millis(self.config.boost_duration_ms)
    }

    /// Evaluate a batch of values against the pair's baseline, then fold
    /// them into it. Returns at most one event per batch.
    pub fn observe(&self, key: &PairKey, values: &[f64], now: Instant) -> Option<NoveltyEvent> {
        let mut finite = values.iter().copied().filter(|v| v.is_finite()).peekable();
        finite.peek()?;

        let mut state = self.pairs.entry(key.clone()).or_default();
        let baseline = state.baseline;
        let trusted = baseline.count >= self.config.min_samples;
        let floor = self.std_dev_floor(baseline.mean);

        let mut worst: Option<(f64, f64)> = None;
        for value in finite {
            if trusted {
                let z = baseline.z_score(value, floor);
                if worst.map_or(true, |(best, _)| z > best) {
                    worst = Some((z, value));
                }
            }
            state.baseline.update(value);
        }

        let (z_score, value) = worst?;
        if z_score <= self.config.z_threshold {
            return None;
        }

        state.boost_until = Some(now + self.boost_duration());
        Some(NoveltyEvent {
            key: key.clone(),
            z_score,
            value,
            mean: baseline.mean,
            std_dev: baseline.std_dev(),
        })
    }

    pub fn baseline(&self, key: &PairKey) -> Option<Baseline> {
        self.pairs.get(key).map(|state| state.baseline)
    }

    pub fn is_boosted(&self, key: &PairKey, now: Instant) -> bool {
        self.pairs
            .get(key)
            .and_then(|state| state.boost_until)
            .is_some_and(|until| until > now)
    }
}

impl Controller for NoveltyDetector {
    fn name(&self) -> &'static str {
        "novelty"
    }

    fn factor(&self, key: &PairKey, now: Instant) -> Result<f64, ControllerError> {
        if self.is_boosted(key, now) {
            Ok(self.config.boost_factor)
        } else {
            Ok(1.0)
        }
    }

    fn forget_sensor(&self, sensor: &SensorId) {
        self.pairs.retain(|key, _| &key.sensor_id != sensor);
    }
}

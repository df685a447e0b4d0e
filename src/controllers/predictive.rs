//! Predictive balancing from periodic attention patterns.
//!
//! Every tick appends each pair's attention level to a bounded history. A
//! discrete Fourier transform of that history finds the dominant period;
//! when one period explains enough of the variation, the level one period
//! ago (shifted by a small lead) predicts the near future. Pairs about to
//! gain attention are sped up early, pairs about to lose it are slowed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::f64::consts::PI;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use sensoflow_types::{AttentionLevel, PairKey, SensorId};

use super::{Controller, TickContext};
use crate::config::PredictiveConfig;
use crate::error::ControllerError;

/// Dominant period of a series, in samples, if one stands out.
///
/// Returns `None` for constant series or when the strongest frequency holds
/// less than `min_power_ratio` of the non-DC power.
pub fn dominant_period(series: &[f64], min_power_ratio: f64) -> Option<usize> {
    let n = series.len();
    if n < 4 {
        return None;
    }
    let mean = series.iter().sum::<f64>() / n as f64;

    let mut total = 0.0;
    let mut best: Option<(usize, f64)> = None;
    for k in 1..=n / 2 {
        let (mut re, mut im) = (0.0, 0.0);
        for (t, value) in series.iter().enumerate() {
            let angle = 2.0 * PI * k as f64 * t as f64 / n as f64;
            re += (value - mean) * angle.cos();
            im -= (value - mean) * angle.sin();
        }
        let power = re * re + im * im;
        total += power;
        if best.map_or(true, |(_, p)| power > p) {
            best = Some((k, power));
        }
    }

    let (k, power) = best?;
    if total <= f64::EPSILON || power / total < min_power_ratio {
        return None;
    }
    let period = (n as f64 / k as f64).round() as usize;
    (period >= 2).then_some(period)
}

#[derive(Debug)]
pub struct PredictiveBalancer {
    config: PredictiveConfig,
    series: Mutex<HashMap<PairKey, VecDeque<f64>>>,
    factors: RwLock<HashMap<PairKey, f64>>,
}

impl PredictiveBalancer {
    pub fn new(config: PredictiveConfig) -> Self {
        Self {
            config,
            series: Mutex::new(HashMap::new()),
            factors: RwLock::new(HashMap::new()),
        }
    }

    /// Append this tick's levels and copy out every full history.
    fn record(&self, attention: &BTreeMap<PairKey, AttentionLevel>) -> Vec<(PairKey, VecDeque<f64>)> {
        let capacity = self.config.history_len;
        let mut series = self.series.lock();

        for key in attention.keys() {
            series.entry(key.clone()).or_default();
        }

        series.retain(|key, history| {
            let level = attention.get(key).map_or(0.0, |level| level.index() as f64);
            history.push_back(level);
            while history.len() > capacity {
                history.pop_front();
            }
            // a pair that has been unwatched for a whole window is forgotten
            history.iter().any(|v| *v > 0.0)
        });

        series
            .iter()
            .filter(|(_, history)| history.len() >= capacity)
            .map(|(key, history)| (key.clone(), history.clone()))
            .collect()
    }

    /// Predict the factor for a full history, or `None` if no pattern.
    fn predict(&self, history: &VecDeque<f64>) -> Option<f64> {
        if history.len() < self.config.history_len {
            return None;
        }
        let series: Vec<f64> = history.iter().copied().collect();
        let period = dominant_period(&series, self.config.min_power_ratio)?;

        let n = series.len();
        let lead = self.config.lead_ticks;
        let cycles = lead / period + 1;
        let index = (n - 1 + lead).checked_sub(cycles * period)?;

        let current = series[n - 1];
        let predicted = series[index];
        if predicted > current {
            Some(self.config.pre_boost)
        } else if predicted < current {
            Some(self.config.pre_throttle)
        } else {
            None
        }
    }

    pub fn history_len(&self, key: &PairKey) -> usize {
        self.series.lock().get(key).map_or(0, VecDeque::len)
    }
}

impl Controller for PredictiveBalancer {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn factor(&self, key: &PairKey, _now: Instant) -> Result<f64, ControllerError> {
        Ok(self.factors.read().get(key).copied().unwrap_or(1.0))
    }

    fn tick(&self, ctx: &TickContext<'_>) -> Result<(), ControllerError> {
        let full = self.record(ctx.attention);

        let mut factors: HashMap<PairKey, f64> = full
            .iter()
            .filter_map(|(key, history)| Some((key.clone(), self.predict(history)?)))
            .collect();

        // drop pairs forgotten while the transforms ran
        let series = self.series.lock();
        factors.retain(|key, _| series.contains_key(key));
        *self.factors.write() = factors;
        Ok(())
    }

    fn forget_sensor(&self, sensor: &SensorId) {
        let mut series = self.series.lock();
        series.retain(|key, _| &key.sensor_id != sensor);
        self.factors.write().retain(|key, _| &key.sensor_id != sensor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sampler::LoadSample;

    fn square(t: usize) -> AttentionLevel {
        if t % 8 < 4 {
            AttentionLevel::High
        } else {
            AttentionLevel::None
        }
    }

    fn run(balancer: &PredictiveBalancer, key: &PairKey, ticks: usize) {
        let load = LoadSample::default();
        let now = Instant::now();
        for t in 0..ticks {
            let mut attention = BTreeMap::new();
            let level = square(t);
            if level > AttentionLevel::None {
                attention.insert(key.clone(), level);
            }
            let ctx = TickContext {
                now,
                wall_clock_ms: 0,
                load: &load,
                attention: &attention,
            };
            balancer.tick(&ctx).unwrap();
        }
    }

    #[test]
    fn finds_period_of_square_wave() {
        let series: Vec<f64> = (0..64).map(|t| if t % 8 < 4 { 3.0 } else { 0.0 }).collect();
        assert_eq!(dominant_period(&series, 0.3), Some(8));
    }

    #[test]
    fn constant_series_has_no_period() {
        assert_eq!(dominant_period(&[2.0; 64], 0.3), None);
    }

    #[test]
    fn boosts_before_attention_returns() {
        let balancer = PredictiveBalancer::new(PredictiveConfig::default());
        let key = PairKey::new("s1", "hr");
        // last sample t=70 is unwatched, t=72 will be watched again
        run(&balancer, &key, 71);
        assert_eq!(balancer.factor(&key, Instant::now()).unwrap(), 0.75);
    }

    #[test]
    fn throttles_before_attention_leaves() {
        let balancer = PredictiveBalancer::new(PredictiveConfig::default());
        let key = PairKey::new("s1", "hr");
        // last sample t=66 is watched, t=68 will not be
        run(&balancer, &key, 67);
        assert_eq!(balancer.factor(&key, Instant::now()).unwrap(), 1.33);
    }

    #[test]
    fn neutral_until_history_is_full() {
        let balancer = PredictiveBalancer::new(PredictiveConfig::default());
        let key = PairKey::new("s1", "hr");
        run(&balancer, &key, 40);
        assert_eq!(balancer.factor(&key, Instant::now()).unwrap(), 1.0);
        assert_eq!(balancer.history_len(&key), 40);
    }

    #[test]
    fn factors_stay_readable_during_ticks() {
        let balancer = PredictiveBalancer::new(PredictiveConfig::default());
        let key = PairKey::new("s1", "hr");
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    let factor = balancer.factor(&key, Instant::now()).unwrap();
                    assert!([1.0, 0.75, 1.33].contains(&factor), "factor {factor}");
                }
            });
            run(&balancer, &key, 200);
            done.store(true, std::sync::atomic::Ordering::Release);
        });
    }

    #[test]
    fn forgetting_a_sensor_clears_history_and_factor() {
        let balancer = PredictiveBalancer::new(PredictiveConfig::default());
        let key = PairKey::new("s1", "hr");
        run(&balancer, &key, 71);
        assert_eq!(balancer.factor(&key, Instant::now()).unwrap(), 0.75);

        balancer.forget_sensor(&SensorId::new("s1"));
        assert_eq!(balancer.history_len(&key), 0);
        assert_eq!(balancer.factor(&key, Instant::now()).unwrap(), 1.0);
    }
}

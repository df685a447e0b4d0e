//! Competitive resource arbitration.
//!
//! Watched pairs compete for a fixed delivery budget. Each pair's priority
//! blends its attention, recent novelty and any alarm severity; shares are
//! allocated by a power law (`pᵅ / Σ pᵅ`) on top of a guaranteed floor, and
//! the factor is how far a pair's share sits from an even split.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sensoflow_types::{AttentionLevel, PairKey, SensorId};

use super::{Controller, TickContext};
use crate::config::ArbiterConfig;
use crate::error::ControllerError;

#[derive(Debug, Default)]
struct Inputs {
    /// Normalized novelty score and when it was observed.
    novelty: HashMap<PairKey, (f64, Instant)>,
    alarms: HashMap<PairKey, f64>,
}

#[derive(Debug)]
pub struct ResourceArbiter {
    config: ArbiterConfig,
    inputs: Mutex<Inputs>,
    factors: RwLock<HashMap<PairKey, f64>>,
}

impl ResourceArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            config,
            inputs: Mutex::new(Inputs::default()),
            factors: RwLock::new(HashMap::new()),
        }
    }

    fn novelty_memory(&self) -> Duration {
        Duration::from_millis(self.config.novelty_memory_ms)
    }

    /// Record a novelty signal for a pair.
    pub fn note_novelty(&self, key: &PairKey, z_score: f64, now: Instant) {
        if !z_score.is_finite() || z_score <= 0.0 {
            return;
        }
        // map z in (0, inf) onto (0, 1)
        let score = z_score / (z_score + 3.0);
        self.inputs.lock().novelty.insert(key.clone(), (score, now));
    }

    /// Set an alarm severity in `[0, 1]` for a pair; `0` clears it.
    pub fn set_alarm(&self, key: &PairKey, severity: f64) {
        let mut inputs = self.inputs.lock();
        if severity.is_finite() && severity > 0.0 {
            inputs.alarms.insert(key.clone(), severity.min(1.0));
        } else {
            inputs.alarms.remove(key);
        }
    }

    /// Priority in `[0, 1]` from the three inputs.
    pub fn priority(&self, attention: AttentionLevel, novelty: f64, alarm: f64) -> f64 {
        let attention = attention.index() as f64 / AttentionLevel::High.index() as f64;
        self.config.attention_weight * attention
            + self.config.novelty_weight * novelty
            + self.config.alarm_weight * alarm
    }

    /// Recompute every pair's factor.
    pub fn rebalance(&self, attention: &BTreeMap<PairKey, AttentionLevel>, now: Instant) {
        let (novelty, alarms) = {
            let mut inputs = self.inputs.lock();
            let memory = self.novelty_memory();
            inputs
                .novelty
                .retain(|_, (_, at)| now.saturating_duration_since(*at) < memory);
            let novelty: HashMap<PairKey, f64> = inputs
                .novelty
                .iter()
                .map(|(key, (score, _))| (key.clone(), *score))
                .collect();
            (novelty, inputs.alarms.clone())
        };

        let factors = self.allocate(attention, &novelty, &alarms);
        *self.factors.write() = factors;
    }

    /// Power-law shares over every pair with any input, as factors.
    fn allocate(
        &self,
        attention: &BTreeMap<PairKey, AttentionLevel>,
        novelty: &HashMap<PairKey, f64>,
        alarms: &HashMap<PairKey, f64>,
    ) -> HashMap<PairKey, f64> {
        let pairs: BTreeSet<PairKey> = attention
            .keys()
            .chain(novelty.keys())
            .chain(alarms.keys())
            .cloned()
            .collect();
        if pairs.is_empty() {
            return HashMap::new();
        }

        let n = pairs.len() as f64;
        let powered: Vec<(PairKey, f64)> = pairs
            .into_iter()
            .map(|key| {
                let novelty = novelty.get(&key).copied().unwrap_or(0.0);
                let alarm = alarms.get(&key).copied().unwrap_or(0.0);
                let level = attention.get(&key).copied().unwrap_or_default();
                let p = self.priority(level, novelty, alarm).max(0.0);
                let weighted = p.powf(self.config.exponent);
                (key, weighted)
            })
            .collect();

        let total: f64 = powered.iter().map(|(_, w)| w).sum();
        let floor = self.config.min_share.clamp(0.0, 1.0);
        let fair = 1.0 / n;

        powered
            .into_iter()
            .map(|(key, weighted)| {
                let competitive = if total > 0.0 { weighted / total } else { fair };
                let share = floor / n + (1.0 - floor) * competitive;
                let factor = if share > 0.0 { fair / share } else { 1.0 };
                (key, factor)
            })
            .collect()
    }
}

impl Controller for ResourceArbiter {
    fn name(&self) -> &'static str {
        "arbiter"
    }

    fn factor(&self, key: &PairKey, _now: Instant) -> Result<f64, ControllerError> {
        Ok(self.factors.read().get(key).copied().unwrap_or(1.0))
    }

    fn tick(&self, ctx: &TickContext<'_>) -> Result<(), ControllerError> {
        self.rebalance(ctx.attention, ctx.now);
        Ok(())
    }

    fn forget_sensor(&self, sensor: &SensorId) {
        let mut inputs = self.inputs.lock();
        inputs.novelty.retain(|key, _| &key.sensor_id != sensor);
        inputs.alarms.retain(|key, _| &key.sensor_id != sensor);
        self.factors.write().retain(|key, _| &key.sensor_id != sensor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::LoadSample;

    fn tick(arbiter: &ResourceArbiter, attention: &BTreeMap<PairKey, AttentionLevel>, now: Instant) {
        let load = LoadSample::default();
        let ctx = TickContext {
            now,
            wall_clock_ms: 0,
            load: &load,
            attention,
        };
        arbiter.tick(&ctx).unwrap();
    }

    #[test]
    fn higher_priority_gets_faster_delivery() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        let high = PairKey::new("s1", "hr");
        let low = PairKey::new("s2", "hr");
        let attention = BTreeMap::from([
            (high.clone(), AttentionLevel::High),
            (low.clone(), AttentionLevel::Low),
        ]);
        let now = Instant::now();
        tick(&arbiter, &attention, now);

        let f_high = arbiter.factor(&high, now).unwrap();
        let f_low = arbiter.factor(&low, now).unwrap();
        assert!(f_high < 1.0, "high factor {f_high}");
        assert!(f_low > 1.0, "low factor {f_low}");
    }

    #[test]
    fn equal_priorities_are_neutral() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        let a = PairKey::new("s1", "hr");
        let b = PairKey::new("s2", "hr");
        let attention = BTreeMap::from([
            (a.clone(), AttentionLevel::Medium),
            (b.clone(), AttentionLevel::Medium),
        ]);
        let now = Instant::now();
        tick(&arbiter, &attention, now);
        assert!((arbiter.factor(&a, now).unwrap() - 1.0).abs() < 1e-9);
        assert!((arbiter.factor(&b, now).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn floor_bounds_the_starved_pair() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        let a = PairKey::new("s1", "hr");
        let b = PairKey::new("s2", "hr");
        let attention = BTreeMap::from([(a.clone(), AttentionLevel::High), (b.clone(), AttentionLevel::None)]);
        let now = Instant::now();
        tick(&arbiter, &attention, now);
        // b has zero priority: share = floor / n = 0.1, fair = 0.5
        assert!((arbiter.factor(&b, now).unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn novelty_raises_priority_until_forgotten() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        let a = PairKey::new("s1", "hr");
        let b = PairKey::new("s2", "hr");
        let attention = BTreeMap::from([
            (a.clone(), AttentionLevel::Medium),
            (b.clone(), AttentionLevel::Medium),
        ]);
        let now = Instant::now();
        arbiter.note_novelty(&a, 6.0, now);
        tick(&arbiter, &attention, now);
        assert!(arbiter.factor(&a, now).unwrap() < arbiter.factor(&b, now).unwrap());

        let later = now + Duration::from_millis(30_001);
        tick(&arbiter, &attention, later);
        assert!((arbiter.factor(&a, later).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_pairs_are_neutral() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        assert_eq!(arbiter.factor(&PairKey::new("x", "y"), Instant::now()).unwrap(), 1.0);
    }

    #[test]
    fn forgotten_sensor_leaves_the_competition() {
        let arbiter = ResourceArbiter::new(ArbiterConfig::default());
        let a = PairKey::new("s1", "hr");
        let b = PairKey::new("s2", "hr");
        let now = Instant::now();
        arbiter.set_alarm(&a, 1.0);
        tick(&arbiter, &BTreeMap::from([(b.clone(), AttentionLevel::Low)]), now);
        // the alarm alone ranks below a watched pair but still competes
        assert!(arbiter.factor(&a, now).unwrap() > 1.0);
        assert!(arbiter.factor(&b, now).unwrap() < 1.0);

        arbiter.forget_sensor(&SensorId::new("s1"));
        assert_eq!(arbiter.factor(&a, now).unwrap(), 1.0);
        tick(&arbiter, &BTreeMap::from([(b.clone(), AttentionLevel::Low)]), now);
        assert!((arbiter.factor(&b, now).unwrap() - 1.0).abs() < 1e-9);
    }
}

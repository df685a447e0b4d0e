//! Tiered in-memory measurement store.
//!
//! Each `(sensor, attribute)` pair owns a bounded *hot* tier of the newest
//! measurements and a bounded *warm* tier of older ones. Limits come from
//! an attribute profile (pose frames keep a single hot entry, physiological
//! waveforms keep hundreds) and shrink with system load.
//!
//! Compaction is amortized: the hot tier may physically hold up to twice its
//! effective limit before the overflow moves to warm in one step, but reads
//! never return more than the effective limit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use sensoflow_types::{LoadLevel, Measurement, PairKey, SensorId};
use tokio::sync::watch;
use tracing::debug;

use crate::config::StoreConfig;
use crate::sampler::LoadSample;

/// Hot and warm limits for one pair at normal load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub hot: usize,
    pub warm: usize,
}

/// Scale a limit by a load factor, rounding up and never reaching zero
/// unless the limit itself is zero.
pub fn scaled_limit(limit: usize, factor: f64) -> usize {
    if limit == 0 {
        return 0;
    }
    ((limit as f64 * factor).ceil() as usize).clamp(1, limit)
}

#[derive(Debug)]
struct Tiers {
    capacity: Capacity,
    hot: VecDeque<Arc<Measurement>>,
    warm: VecDeque<Arc<Measurement>>,
    last_write: Instant,
}

impl Tiers {
    fn new(capacity: Capacity, now: Instant) -> Self {
        Self {
            capacity,
            hot: VecDeque::new(),
            warm: VecDeque::new(),
            last_write: now,
        }
    }

    /// Append and compact; returns how many measurements were evicted.
    fn push(&mut self, measurement: Arc<Measurement>, factor: f64, now: Instant) -> u64 {
        self.last_write = now;
        self.hot.push_back(measurement);

        let hot_limit = scaled_limit(self.capacity.hot, factor);
        if self.hot.len() < (2 * hot_limit).max(1) {
            return 0;
        }

        let overflow = self.hot.len() - hot_limit;
        self.warm.extend(self.hot.drain(..overflow));

        let warm_limit = scaled_limit(self.capacity.warm, factor);
        let mut evicted = 0;
        while self.warm.len() > warm_limit {
            self.warm.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn hot_view(&self, factor: f64) -> Vec<Arc<Measurement>> {
        let limit = scaled_limit(self.capacity.hot, factor);
        let skip = self.hot.len().saturating_sub(limit);
        self.hot.iter().skip(skip).cloned().collect()
    }

    fn warm_view(&self, factor: f64) -> Vec<Arc<Measurement>> {
        let limit = scaled_limit(self.capacity.warm, factor);
        let skip = self.warm.len().saturating_sub(limit);
        self.warm.iter().skip(skip).cloned().collect()
    }
}

/// Counters describing the store's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub pairs: usize,
    pub hot: usize,
    pub warm: usize,
    pub evicted: u64,
}

/// Concurrent per-pair storage with load-aware limits.
#[derive(Debug)]
pub struct TieredStore {
    config: StoreConfig,
    entries: DashMap<PairKey, Arc<RwLock<Tiers>>>,
    load: watch::Receiver<LoadSample>,
    evicted: AtomicU64,
}

impl TieredStore {
    pub fn new(config: StoreConfig, load: watch::Receiver<LoadSample>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            load,
            evicted: AtomicU64::new(0),
        }
    }

    /// Limits for an attribute at normal load.
    pub fn capacity_for(&self, attribute: &str) -> Capacity {
        let attribute = attribute.to_ascii_lowercase();
        self.config
            .profiles
            .iter()
            .find(|profile| {
                profile
                    .patterns
                    .iter()
                    .any(|pattern| attribute.contains(&pattern.to_ascii_lowercase()))
            })
            .map(|profile| Capacity {
                hot: profile.hot_limit,
                warm: profile.warm_limit,
            })
            .unwrap_or(Capacity {
                hot: self.config.default_hot_limit,
                warm: self.config.default_warm_limit,
            })
    }

    /// Limits for an attribute at the current load.
    pub fn effective_capacity(&self, attribute: &str) -> Capacity {
        let base = self.capacity_for(attribute);
        let factor = self.load_factor();
        Capacity {
            hot: scaled_limit(base.hot, factor),
            warm: scaled_limit(base.warm, factor),
        }
    }

    fn load_level(&self) -> LoadLevel {
        self.load.borrow().level
    }

    fn load_factor(&self) -> f64 {
        self.config.load_factors.for_level(self.load_level())
    }

    fn tiers(&self, key: &PairKey) -> Option<Arc<RwLock<Tiers>>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Append a measurement to its pair.
    pub fn insert(&self, measurement: Arc<Measurement>) {
        let now = crate::clock_now();
        let factor = self.load_factor();
        let key = measurement.key();

        // Fast path: pair already exists
        let tiers = match self.tiers(&key) {
            Some(tiers) => tiers,
            None => {
                let capacity = self.capacity_for(key.attribute_id.as_str());
                self.entries
                    .entry(key)
                    .or_insert_with(|| Arc::new(RwLock::new(Tiers::new(capacity, now))))
                    .clone()
            }
        };

        let evicted = tiers.write().push(measurement, factor, now);
        if evicted > 0 {
            self.evicted.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Newest measurements of a pair, oldest first, capped at the
    /// effective hot limit.
    pub fn hot(&self, key: &PairKey) -> Vec<Arc<Measurement>> {
        self.tiers(key)
            .map(|tiers| tiers.read().hot_view(self.load_factor()))
            .unwrap_or_default()
    }

    /// Readable hot count, without copying the measurements.
    pub fn hot_len(&self, key: &PairKey) -> usize {
        let factor = self.load_factor();
        self.tiers(key).map_or(0, |tiers| {
            let tiers = tiers.read();
            tiers.hot.len().min(scaled_limit(tiers.capacity.hot, factor))
        })
    }

    /// Older measurements of a pair, oldest first.
    pub fn warm(&self, key: &PairKey) -> Vec<Arc<Measurement>> {
        self.tiers(key)
            .map(|tiers| tiers.read().warm_view(self.load_factor()))
            .unwrap_or_default()
    }

    /// The newest measurement of a pair.
    pub fn latest(&self, key: &PairKey) -> Option<Arc<Measurement>> {
        self.tiers(key)
            .and_then(|tiers| tiers.read().hot.back().cloned())
    }

    /// Whether a pair has stored history.
    pub fn contains(&self, key: &PairKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether any pair of `sensor` is stored.
    pub fn has_sensor(&self, sensor: &SensorId) -> bool {
        self.entries.iter().any(|entry| &entry.key().sensor_id == sensor)
    }

    /// Drop every pair of a sensor, returning how many were removed.
    pub fn remove_sensor(&self, sensor: &SensorId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| &key.sensor_id != sensor);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(sensor = %sensor, removed, "Released sensor storage");
        }
        removed
    }

    /// Drop one pair; returns whether it was stored.
    pub fn remove_pair(&self, key: &PairKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Pairs that have not been written for at least `idle`.
    pub fn idle_pairs(&self, idle: Duration, now: Instant) -> Vec<PairKey> {
        self.entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().read().last_write) >= idle)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Pair and measurement counts across both tiers.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            evicted: self.evicted.load(Ordering::Relaxed),
            ..StoreStats::default()
        };
        for entry in self.entries.iter() {
            let tiers = entry.value().read();
            stats.pairs += 1;
            stats.hot += tiers.hot.len();
            stats.warm += tiers.warm.len();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_at(level: LoadLevel) -> (watch::Sender<LoadSample>, TieredStore) {
        let (tx, rx) = watch::channel(LoadSample::at(level));
        (tx, TieredStore::new(StoreConfig::default(), rx))
    }

    fn m(attr: &str, ts: i64) -> Arc<Measurement> {
        Arc::new(Measurement::with_timestamp("s1", attr, ts as f64, ts))
    }

    #[test]
    fn profiles_match_attribute_names() {
        let (_tx, store) = store_at(LoadLevel::Normal);
        assert_eq!(store.capacity_for("pose3d"), Capacity { hot: 1, warm: 0 });
        assert_eq!(store.capacity_for("Skeleton"), Capacity { hot: 1, warm: 0 });
        assert_eq!(store.capacity_for("ecg_lead2"), Capacity { hot: 150, warm: 500 });
        assert_eq!(store.capacity_for("temperature"), Capacity { hot: 50, warm: 100 });
    }

    #[test]
    fn scaled_limits_round_up_and_stay_positive() {
        assert_eq!(scaled_limit(50, 0.05), 3);
        assert_eq!(scaled_limit(1, 0.05), 1);
        assert_eq!(scaled_limit(0, 1.0), 0);
        assert_eq!(scaled_limit(150, 0.2), 30);
    }

    #[test]
    fn eviction_starts_at_twice_hot_limit() {
        let (_tx, store) = store_at(LoadLevel::Normal);
        let key = PairKey::new("s1", "temperature");

        for ts in 0..99 {
            store.insert(m("temperature", ts));
        }
        assert!(store.warm(&key).is_empty());

        store.insert(m("temperature", 99));
        let warm = store.warm(&key);
        assert_eq!(warm.len(), 50);
        assert_eq!(warm.first().unwrap().timestamp, 0);

        let hot = store.hot(&key);
        assert_eq!(hot.len(), 50);
        assert_eq!(hot.first().unwrap().timestamp, 50);
        assert_eq!(hot.last().unwrap().timestamp, 99);
    }

    #[test]
    fn hot_reads_never_exceed_effective_limit() {
        let (_tx, store) = store_at(LoadLevel::Normal);
        let key = PairKey::new("s1", "temperature");
        for ts in 0..80 {
            store.insert(m("temperature", ts));
            assert!(store.hot(&key).len() <= 50);
            assert_eq!(store.hot_len(&key), store.hot(&key).len());
        }
        assert_eq!(store.latest(&key).unwrap().timestamp, 79);
    }

    #[test]
    fn pose_keeps_only_latest_frame() {
        let (_tx, store) = store_at(LoadLevel::Normal);
        let key = PairKey::new("s1", "pose");
        for ts in 0..10 {
            store.insert(m("pose", ts));
        }
        let hot = store.hot(&key);
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].timestamp, 9);
        assert!(store.warm(&key).is_empty());
        assert!(store.stats().evicted >= 8);
    }

    #[test]
    fn critical_load_shrinks_limits() {
        let (tx, store) = store_at(LoadLevel::Normal);
        let key = PairKey::new("s1", "temperature");
        for ts in 0..60 {
            store.insert(m("temperature", ts));
        }
        assert_eq!(store.hot(&key).len(), 50);

        tx.send_replace(LoadSample::at(LoadLevel::Critical));
        assert_eq!(store.effective_capacity("temperature"), Capacity { hot: 3, warm: 5 });
        let hot = store.hot(&key);
        assert_eq!(hot.len(), 3);
        assert_eq!(hot.last().unwrap().timestamp, 59);

        store.insert(m("temperature", 60));
        let stats = store.stats();
        assert_eq!(stats.hot, 3);
        assert_eq!(stats.warm, 5);
    }

    #[test]
    fn remove_sensor_releases_all_pairs() {
        let (_tx, store) = store_at(LoadLevel::Normal);
        store.insert(m("temperature", 1));
        store.insert(m("ecg", 1));
        store.insert(Arc::new(Measurement::with_timestamp("s2", "ecg", 1.0, 1)));

        assert_eq!(store.remove_sensor(&SensorId::new("s1")), 2);
        assert_eq!(store.stats().pairs, 1);
        assert!(store.hot(&PairKey::new("s1", "ecg")).is_empty());
    }

    #[test]
    fn idle_pairs_by_last_write() {
        let (_tx, store) = store_at(LoadLevel::Normal);
        store.insert(m("temperature", 1));
        let now = Instant::now();
        assert!(store.idle_pairs(Duration::from_secs(60), now).is_empty());
        let later = now + Duration::from_secs(61);
        assert_eq!(
            store.idle_pairs(Duration::from_secs(60), later),
            vec![PairKey::new("s1", "temperature")]
        );
    }
}

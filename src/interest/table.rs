//! Attention view storage.
//!
//! The table owns every active [`AttentionView`] and each pair's aggregate
//! level. Reads go straight to the concurrent maps; mutations are
//! serialized by a single admin lock so that bulk operations apply
//! atomically with respect to each other and report one batch of changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use sensoflow_types::{AttentionLevel, ConnectionId, PairKey, SensorId};

use crate::events::AttentionChange;

/// One viewer's interest in one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionView {
    pub connection: ConnectionId,
    pub key: PairKey,
    pub requested: AttentionLevel,
    /// Upper bound imposed by the viewer's device (battery saver etc).
    pub energy_ceiling: Option<AttentionLevel>,
}

impl AttentionView {
    pub fn new(connection: ConnectionId, key: PairKey, requested: AttentionLevel) -> Self {
        Self {
            connection,
            key,
            requested,
            energy_ceiling: None,
        }
    }

    pub fn with_ceiling(mut self, ceiling: AttentionLevel) -> Self {
        self.energy_ceiling = Some(ceiling);
        self
    }

    /// Requested level after the energy ceiling.
    pub fn effective(&self) -> AttentionLevel {
        self.requested.capped(self.energy_ceiling)
    }
}

#[derive(Debug, Default)]
struct PairInterest {
    views: HashMap<ConnectionId, AttentionLevel>,
    level: AttentionLevel,
    /// Set once the last view is gone; the level holds until then.
    lingering_until: Option<Instant>,
}

impl PairInterest {
    fn level_at(&self, now: Instant) -> AttentionLevel {
        if !self.views.is_empty() {
            return self.level;
        }
        match self.lingering_until {
            Some(until) if until > now => self.level,
            _ => AttentionLevel::None,
        }
    }

    fn recompute(&mut self) {
        self.level = self.views.values().copied().max().unwrap_or_default();
    }
}

/// Before-levels of every pair touched by one mutation.
type Touched = BTreeMap<PairKey, AttentionLevel>;

/// Concurrent store of attention views.
#[derive(Debug)]
pub struct InterestTable {
    pairs: DashMap<PairKey, PairInterest>,
    connections: DashMap<ConnectionId, HashSet<PairKey>>,
    admin: Mutex<()>,
    idle_decay: Duration,
}

impl InterestTable {
    pub fn new(idle_decay: Duration) -> Self {
        Self {
            pairs: DashMap::new(),
            connections: DashMap::new(),
            admin: Mutex::new(()),
            idle_decay,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Aggregate level of a pair at `now`, including any lingering level.
    pub fn level_at(&self, key: &PairKey, now: Instant) -> AttentionLevel {
        self.pairs
            .get(key)
            .map(|pair| pair.level_at(now))
            .unwrap_or_default()
    }

    /// Every pair above `None` at `now`.
    pub fn snapshot(&self, now: Instant) -> BTreeMap<PairKey, AttentionLevel> {
        self.pairs
            .iter()
            .filter_map(|entry| {
                let level = entry.value().level_at(now);
                (level > AttentionLevel::None).then(|| (entry.key().clone(), level))
            })
            .collect()
    }

    /// Number of pairs with at least one active view, per level.
    pub fn level_counts(&self) -> [usize; 4] {
        let mut counts = [0; 4];
        for entry in self.pairs.iter() {
            if !entry.value().views.is_empty() {
                counts[entry.value().level.index()] += 1;
            }
        }
        counts
    }

    /// Number of views on a pair.
    pub fn viewers(&self, key: &PairKey) -> usize {
        self.pairs.get(key).map_or(0, |pair| pair.views.len())
    }

    /// Pairs a connection is viewing.
    pub fn views_of(&self, connection: ConnectionId) -> Vec<PairKey> {
        let mut keys: Vec<PairKey> = self
            .connections
            .get(&connection)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Every connection holding at least one view.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of pairs tracked, including lingering ones.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn register_view(&self, view: AttentionView, now: Instant) -> Vec<AttentionChange> {
        self.register_views(std::iter::once(view), now)
    }

    /// Register several views under one admin lock.
    pub fn register_views(
        &self,
        views: impl IntoIterator<Item = AttentionView>,
        now: Instant,
    ) -> Vec<AttentionChange> {
        let _admin = self.admin.lock();
        let mut touched = Touched::new();
        for view in views {
            self.apply_register(view, now, &mut touched);
        }
        self.changes(touched, now)
    }

    pub fn unregister_view(
        &self,
        connection: ConnectionId,
        key: &PairKey,
        now: Instant,
    ) -> Vec<AttentionChange> {
        self.unregister_views(connection, std::slice::from_ref(key), now)
    }

    /// Remove several of one connection's views under one admin lock.
    pub fn unregister_views(
        &self,
        connection: ConnectionId,
        keys: &[PairKey],
        now: Instant,
    ) -> Vec<AttentionChange> {
        let _admin = self.admin.lock();
        let mut touched = Touched::new();
        for key in keys {
            self.apply_unregister(connection, key, now, &mut touched);
        }
        self.changes(touched, now)
    }

    /// Remove every view of a connection.
    pub fn disconnect(&self, connection: ConnectionId, now: Instant) -> Vec<AttentionChange> {
        let _admin = self.admin.lock();
        let keys: Vec<PairKey> = self
            .connections
            .get(&connection)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        let mut touched = Touched::new();
        for key in &keys {
            self.apply_unregister(connection, key, now, &mut touched);
        }
        self.connections.remove(&connection);
        self.changes(touched, now)
    }

    /// Drop every pair of a sensor immediately, without lingering.
    pub fn remove_sensor(&self, sensor: &SensorId, now: Instant) -> Vec<AttentionChange> {
        let _admin = self.admin.lock();
        let keys: Vec<PairKey> = self
            .pairs
            .iter()
            .filter(|entry| &entry.key().sensor_id == sensor)
            .map(|entry| entry.key().clone())
            .collect();

        let mut touched = Touched::new();
        for key in keys {
            let before = self.level_at(&key, now);
            let Some((_, pair)) = self.pairs.remove(&key) else {
                continue;
            };
            touched.insert(key.clone(), before);
            for connection in pair.views.keys() {
                self.forget_connection_key(*connection, &key);
            }
        }
        self.changes(touched, now)
    }

    /// Drop lingering levels that have expired.
    pub fn decay(&self, now: Instant) -> Vec<AttentionChange> {
        let _admin = self.admin.lock();
        let expired: Vec<(PairKey, AttentionLevel)> = self
            .pairs
            .iter()
            .filter(|entry| {
                let pair = entry.value();
                pair.views.is_empty() && pair.lingering_until.map_or(true, |until| until <= now)
            })
            .map(|entry| (entry.key().clone(), entry.value().level))
            .collect();

        let mut changes = Vec::new();
        for (key, previous) in expired {
            self.pairs
                .remove_if(&key, |_, pair| pair.views.is_empty());
            if previous > AttentionLevel::None {
                changes.push(AttentionChange {
                    key,
                    previous,
                    current: AttentionLevel::None,
                });
            }
        }
        changes
    }

    fn apply_register(&self, view: AttentionView, now: Instant, touched: &mut Touched) {
        if !touched.contains_key(&view.key) {
            touched.insert(view.key.clone(), self.level_at(&view.key, now));
        }

        let effective = view.effective();
        {
            let mut pair = self.pairs.entry(view.key.clone()).or_default();
            pair.views.insert(view.connection, effective);
            pair.lingering_until = None;
            pair.recompute();
        }
        self.connections
            .entry(view.connection)
            .or_default()
            .insert(view.key);
    }

    fn apply_unregister(
        &self,
        connection: ConnectionId,
        key: &PairKey,
        now: Instant,
        touched: &mut Touched,
    ) {
        if !touched.contains_key(key) {
            touched.insert(key.clone(), self.level_at(key, now));
        }

        let mut drop_pair = false;
        if let Some(mut pair) = self.pairs.get_mut(key) {
            if pair.views.remove(&connection).is_some() {
                if pair.views.is_empty() {
                    if self.idle_decay > Duration::ZERO && pair.level > AttentionLevel::None {
                        pair.lingering_until = Some(now + self.idle_decay);
                    } else {
                        drop_pair = true;
                    }
                } else {
                    pair.recompute();
                }
            }
        }
        if drop_pair {
            self.pairs.remove_if(key, |_, pair| pair.views.is_empty());
        }
        self.forget_connection_key(connection, key);
    }

    fn forget_connection_key(&self, connection: ConnectionId, key: &PairKey) {
        if let Some(mut keys) = self.connections.get_mut(&connection) {
            keys.remove(key);
        }
        self.connections
            .remove_if(&connection, |_, keys| keys.is_empty());
    }

    fn changes(&self, touched: Touched, now: Instant) -> Vec<AttentionChange> {
        touched
            .into_iter()
            .filter_map(|(key, previous)| {
                let current = self.level_at(&key, now);
                (current != previous).then_some(AttentionChange {
                    key,
                    previous,
                    current,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str, a: &str) -> PairKey {
        PairKey::new(s, a)
    }

    fn view(conn: u64, k: &PairKey, level: AttentionLevel) -> AttentionView {
        AttentionView::new(ConnectionId(conn), k.clone(), level)
    }

    #[test]
    fn aggregate_is_max_of_views() {
        let table = InterestTable::new(Duration::ZERO);
        let now = Instant::now();
        let k = key("s1", "temp");

        table.register_view(view(1, &k, AttentionLevel::Low), now);
        table.register_view(view(2, &k, AttentionLevel::High), now);
        table.register_view(view(3, &k, AttentionLevel::Medium), now);
        assert_eq!(table.level_at(&k, now), AttentionLevel::High);

        table.unregister_view(ConnectionId(2), &k, now);
        assert_eq!(table.level_at(&k, now), AttentionLevel::Medium);
    }

    #[test]
    fn energy_ceiling_caps_effective_level() {
        let table = InterestTable::new(Duration::ZERO);
        let now = Instant::now();
        let k = key("s1", "temp");
        table.register_view(
            view(1, &k, AttentionLevel::High).with_ceiling(AttentionLevel::Low),
            now,
        );
        assert_eq!(table.level_at(&k, now), AttentionLevel::Low);
    }

    #[test]
    fn re_registering_replaces_previous_view() {
        let table = InterestTable::new(Duration::ZERO);
        let now = Instant::now();
        let k = key("s1", "temp");
        table.register_view(view(1, &k, AttentionLevel::High), now);
        let changes = table.register_view(view(1, &k, AttentionLevel::Low), now);
        assert_eq!(table.level_at(&k, now), AttentionLevel::Low);
        assert_eq!(table.viewers(&k), 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, AttentionLevel::High);
    }

    #[test]
    fn last_view_lingers_until_decay() {
        let decay = Duration::from_secs(10);
        let table = InterestTable::new(decay);
        let now = Instant::now();
        let k = key("s1", "temp");

        table.register_view(view(1, &k, AttentionLevel::High), now);
        let changes = table.unregister_view(ConnectionId(1), &k, now);
        assert!(changes.is_empty());
        assert_eq!(table.level_at(&k, now + Duration::from_secs(5)), AttentionLevel::High);
        assert_eq!(table.level_at(&k, now + decay), AttentionLevel::None);

        assert!(table.decay(now + Duration::from_secs(5)).is_empty());
        let changes = table.decay(now + decay);
        assert_eq!(
            changes,
            vec![AttentionChange {
                key: k.clone(),
                previous: AttentionLevel::High,
                current: AttentionLevel::None,
            }]
        );
        assert_eq!(table.pair_count(), 0);
    }

    #[test]
    fn new_view_cancels_lingering() {
        let table = InterestTable::new(Duration::from_secs(10));
        let now = Instant::now();
        let k = key("s1", "temp");
        table.register_view(view(1, &k, AttentionLevel::High), now);
        table.unregister_view(ConnectionId(1), &k, now);
        table.register_view(view(2, &k, AttentionLevel::Low), now);
        assert_eq!(table.level_at(&k, now + Duration::from_secs(60)), AttentionLevel::Low);
        assert!(table.decay(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn bulk_matches_sequential() {
        let now = Instant::now();
        let views: Vec<AttentionView> = (0..30)
            .map(|i| {
                let level = AttentionLevel::from_index(i % 4);
                view(i as u64 % 5, &key(&format!("s{}", i % 7), "temp"), level)
            })
            .collect();

        let bulk = InterestTable::new(Duration::ZERO);
        bulk.register_views(views.clone(), now);

        let sequential = InterestTable::new(Duration::ZERO);
        for v in views {
            sequential.register_view(v, now);
        }

        assert_eq!(bulk.snapshot(now), sequential.snapshot(now));
        assert_eq!(bulk.level_counts(), sequential.level_counts());
        for conn in 0..5 {
            assert_eq!(bulk.views_of(ConnectionId(conn)), sequential.views_of(ConnectionId(conn)));
        }
    }

    #[test]
    fn bulk_reports_one_change_per_pair() {
        let table = InterestTable::new(Duration::ZERO);
        let now = Instant::now();
        let k = key("s1", "temp");
        let changes = table.register_views(
            vec![
                view(1, &k, AttentionLevel::Low),
                view(2, &k, AttentionLevel::High),
            ],
            now,
        );
        assert_eq!(
            changes,
            vec![AttentionChange {
                key: k,
                previous: AttentionLevel::None,
                current: AttentionLevel::High,
            }]
        );
    }

    #[test]
    fn disconnect_removes_all_views_of_connection() {
        let table = InterestTable::new(Duration::ZERO);
        let now = Instant::now();
        let a = key("s1", "temp");
        let b = key("s2", "hr");
        table.register_views(
            vec![
                view(1, &a, AttentionLevel::High),
                view(1, &b, AttentionLevel::Medium),
                view(2, &b, AttentionLevel::Low),
            ],
            now,
        );

        let changes = table.disconnect(ConnectionId(1), now);
        assert_eq!(changes.len(), 2);
        assert!(table.views_of(ConnectionId(1)).is_empty());
        assert_eq!(table.level_at(&a, now), AttentionLevel::None);
        assert_eq!(table.level_at(&b, now), AttentionLevel::Low);
        assert_eq!(table.connection_count(), 1);
        assert_eq!(table.connections(), vec![ConnectionId(2)]);
    }

    #[test]
    fn remove_sensor_skips_lingering() {
        let table = InterestTable::new(Duration::from_secs(30));
        let now = Instant::now();
        let a = key("s1", "temp");
        let b = key("s1", "hr");
        table.register_view(view(1, &a, AttentionLevel::High), now);
        table.register_view(view(1, &b, AttentionLevel::Low), now);

        let changes = table.remove_sensor(&SensorId::new("s1"), now);
        assert_eq!(changes.len(), 2);
        assert_eq!(table.pair_count(), 0);
        assert!(table.views_of(ConnectionId(1)).is_empty());
        assert_eq!(table.connection_count(), 0);
    }

    #[test]
    fn level_counts_only_count_viewed_pairs() {
        let table = InterestTable::new(Duration::from_secs(30));
        let now = Instant::now();
        let a = key("s1", "temp");
        let b = key("s2", "temp");
        table.register_view(view(1, &a, AttentionLevel::High), now);
        table.register_view(view(1, &b, AttentionLevel::High), now);
        table.unregister_view(ConnectionId(1), &b, now);

        assert_eq!(table.level_counts(), [0, 0, 0, 1]);
        // b still lingers for readers
        assert_eq!(table.snapshot(now).len(), 2);
    }
}

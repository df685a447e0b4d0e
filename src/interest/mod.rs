//! Interest tracking and delivery windows.
//!
//! The [`InterestTracker`] combines the view table, the current load level
//! and the adaptive controllers to decide how long a pair's data may be
//! batched before delivery:
//!
//! ```text
//! window = base × attention multiplier × load multiplier × controller factor
//! ```
//!
//! clamped to the attention level's `[min, max]`.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sensoflow::config::PipelineConfig;
//! use sensoflow::controllers::ControllerSet;
//! use sensoflow::events::EventBus;
//! use sensoflow::interest::{AttentionView, InterestTracker};
//! use sensoflow::sampler::LoadSample;
//! use sensoflow_types::{AttentionLevel, ConnectionId, Millis, PairKey};
//! use tokio::sync::watch;
//!
//! let config = PipelineConfig::default();
//! let (_load_tx, load_rx) = watch::channel(LoadSample::default());
//! let tracker = InterestTracker::new(&config, ControllerSet::new(0.5, 5.0), load_rx, EventBus::default());
//!
//! let key = PairKey::new("s1", "temp");
//! tracker.register_view(AttentionView::new(ConnectionId(1), key.clone(), AttentionLevel::High));
//!
//! let window = tracker.delivery_window(Millis(100), &key);
//! assert_eq!(window, Millis(20));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sensoflow_types::{
    AttentionLevel, AttributeId, ConnectionId, LoadLevel, Millis, PairKey, SensorId,
};
use tokio::sync::watch;

use crate::config::{AttentionConfig, AttentionProfile, LoadMultipliers, PipelineConfig};
use crate::controllers::{ControllerSet, TickContext};
use crate::events::{AttentionChange, EventBus};
use crate::sampler::LoadSample;

mod table;
mod worker;

pub use table::{AttentionView, InterestTable};
pub use worker::run_interest_worker;

/// Attention state plus everything needed to turn it into windows.
#[derive(Debug)]
pub struct InterestTracker {
    table: Arc<InterestTable>,
    config: AttentionConfig,
    multipliers: LoadMultipliers,
    controllers: ControllerSet,
    tick_interval: Duration,
    load: watch::Receiver<LoadSample>,
    events: EventBus,
}

impl InterestTracker {
    pub fn new(
        config: &PipelineConfig,
        controllers: ControllerSet,
        load: watch::Receiver<LoadSample>,
        events: EventBus,
    ) -> Self {
        Self {
            table: Arc::new(InterestTable::new(config.attention.idle_decay())),
            config: config.attention.clone(),
            multipliers: config.sampler.multipliers,
            controllers,
            tick_interval: config.controllers.tick_interval(),
            load,
            events,
        }
    }

    /// Underlying view table.
    pub fn table(&self) -> &Arc<InterestTable> {
        &self.table
    }

    /// Controllers whose factors scale delivery windows.
    pub fn controllers(&self) -> &ControllerSet {
        &self.controllers
    }

    /// How often the worker ticks the controllers.
    pub fn controller_tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Attention profiles and decay settings.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Window and batch settings for one attention level.
    pub fn profile(&self, level: AttentionLevel) -> &AttentionProfile {
        self.config.profile(level)
    }

    /// Latest published load sample.
    pub fn load(&self) -> LoadSample {
        self.load.borrow().clone()
    }

    fn publish(&self, changes: Vec<AttentionChange>) -> Vec<AttentionChange> {
        self.events.emit_attention(&changes);
        changes
    }

    // ------------------------------------------------------------------
    // View administration
    // ------------------------------------------------------------------

    /// Add or replace one view and publish the resulting changes.
    pub fn register_view(&self, view: AttentionView) -> Vec<AttentionChange> {
        self.publish(self.table.register_view(view, crate::clock_now()))
    }

    /// Add or replace several views as one batch.
    pub fn register_views(&self, views: Vec<AttentionView>) -> Vec<AttentionChange> {
        self.publish(self.table.register_views(views, crate::clock_now()))
    }

    /// Remove one view of a connection.
    pub fn unregister_view(&self, connection: ConnectionId, key: &PairKey) -> Vec<AttentionChange> {
        self.publish(self.table.unregister_view(connection, key, crate::clock_now()))
    }

    /// Remove several views of a connection as one batch.
    pub fn unregister_views(
        &self,
        connection: ConnectionId,
        keys: &[PairKey],
    ) -> Vec<AttentionChange> {
        self.publish(self.table.unregister_views(connection, keys, crate::clock_now()))
    }

    /// Remove every view of a connection.
    pub fn disconnect(&self, connection: ConnectionId) -> Vec<AttentionChange> {
        self.publish(self.table.disconnect(connection, crate::clock_now()))
    }

    /// Forget a sensor's pairs and every controller's state for it.
    pub fn remove_sensor(&self, sensor: &SensorId) -> Vec<AttentionChange> {
        let changes = self.table.remove_sensor(sensor, crate::clock_now());
        self.controllers.forget_sensor(sensor);
        self.publish(changes)
    }

    /// Drop expired lingering levels.
    pub fn decay_expired(&self, now: Instant) -> Vec<AttentionChange> {
        self.publish(self.table.decay(now))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Aggregate level of a pair now.
    pub fn attention_level(&self, key: &PairKey) -> AttentionLevel {
        self.table.level_at(key, crate::clock_now())
    }

    /// Aggregate level of a pair at `now`.
    pub fn attention_level_at(&self, key: &PairKey, now: Instant) -> AttentionLevel {
        self.table.level_at(key, now)
    }

    /// Every pair currently above `None`.
    pub fn snapshot(&self) -> BTreeMap<PairKey, AttentionLevel> {
        self.table.snapshot(crate::clock_now())
    }

    /// Watched pairs per attention level.
    pub fn level_counts(&self) -> [usize; 4] {
        self.table.level_counts()
    }

    /// Window multiplier configured for a load level.
    pub fn load_multiplier(&self, level: LoadLevel) -> f64 {
        self.multipliers.for_level(level)
    }

    /// Delivery window for a pair identified by its parts.
    pub fn calculate_delivery_window(
        &self,
        base: Millis,
        sensor: &SensorId,
        attribute: &AttributeId,
    ) -> Millis {
        let key = PairKey {
            sensor_id: sensor.clone(),
            attribute_id: attribute.clone(),
        };
        self.delivery_window(base, &key)
    }

    /// Delivery window for a pair at its current attention and load.
    pub fn delivery_window(&self, base: Millis, key: &PairKey) -> Millis {
        let now = crate::clock_now();
        let level = self.table.level_at(key, now);
        let load = self.load.borrow().level;
        self.window_for(base, key, level, load, now)
    }

    /// Delivery window for explicit attention and load levels.
    pub fn window_for(
        &self,
        base: Millis,
        key: &PairKey,
        level: AttentionLevel,
        load: LoadLevel,
        now: Instant,
    ) -> Millis {
        let profile = self.config.profile(level);
        let factor = self.controllers.factor(key, now);
        let raw = base.as_f64() * profile.window_multiplier * self.load_multiplier(load) * factor;
        Millis::from_f64(raw).clamp_to(profile.min_window(), profile.max_window())
    }

    /// Run one controller tick against the current attention and load.
    pub fn tick_controllers(&self, now: Instant, wall_clock_ms: i64) {
        let attention = self.table.snapshot(now);
        let load = self.load();
        let ctx = TickContext {
            now,
            wall_clock_ms,
            load: &load,
            attention: &attention,
        };
        self.controllers.tick(&ctx);
    }
}

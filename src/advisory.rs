//! Backpressure advisories for producers.
//!
//! An advisory tells a producer how long to batch before sending, how many
//! measurements to put in a batch, and whether to stop sending entirely.
//! The window it carries is the attention-dependent window at normal load;
//! the current load enters through `load_multiplier`, so a client computing
//! `recommended_batch_window × load_multiplier` lands on the same window the
//! pipeline uses internally, always inside the level's bounds.
//!
//! | attention | window at base 500ms | batch size |
//! |-----------|----------------------|------------|
//! | high      | 100ms                | 1          |
//! | medium    | 500ms                | 5          |
//! | low       | 2000ms               | 10         |
//! | none      | 5000ms               | 20         |
//!
//! Low and unwatched pairs are paused when load is critical or memory
//! protection is active. Memory protection additionally stretches the window
//! of pairs that keep sending.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use sensoflow_types::{AttentionLevel, BackpressureAdvisory, LoadLevel, PairKey, SensorId};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::AdvisoryConfig;
use crate::events::PipelineEvent;
use crate::interest::InterestTracker;
use crate::sampler::LoadSample;

/// Turns attention and load into advisories.
#[derive(Debug)]
pub struct AdvisoryComputer {
    tracker: Arc<InterestTracker>,
    config: AdvisoryConfig,
}

impl AdvisoryComputer {
    pub fn new(tracker: Arc<InterestTracker>, config: AdvisoryConfig) -> Self {
        Self { tracker, config }
    }

    /// Advisory for a pair right now.
    pub fn compute(&self, key: &PairKey) -> BackpressureAdvisory {
        let now = crate::clock_now();
        let level = self.tracker.attention_level_at(key, now);
        let load = self.tracker.load();
        self.compute_at(key, level, &load, now, sensoflow_types::current_timestamp_ms())
    }

    /// Advisory for explicit attention and load.
    pub fn compute_at(
        &self,
        key: &PairKey,
        level: AttentionLevel,
        load: &LoadSample,
        now: Instant,
        timestamp: i64,
    ) -> BackpressureAdvisory {
        let profile = self.tracker.profile(level);
        let paused =
            BackpressureAdvisory::pause_required(level, load.level, load.memory_protection);

        let window = self
            .tracker
            .window_for(self.config.base_window(), key, level, LoadLevel::Normal, now);

        let mut multiplier = self.tracker.load_multiplier(load.level);
        if load.memory_protection && !paused {
            multiplier *= self.config.memory_protection_multiplier;
        }
        // keep window × multiplier inside the level's bounds
        let base = window.as_f64().max(1.0);
        let multiplier = multiplier
            .max(profile.min_window().as_f64() / base)
            .min(profile.max_window().as_f64() / base);

        BackpressureAdvisory::builder()
            .attention_level(level)
            .system_load(load.level)
            .memory_protection_active(load.memory_protection)
            .paused(paused)
            .recommended_batch_window(u32::try_from(window.as_millis()).unwrap_or(u32::MAX))
            .recommended_batch_size(profile.batch_size)
            .load_multiplier(multiplier as f32)
            .timestamp(timestamp)
            .build()
    }
}

/// Same advice, ignoring when it was issued.
fn same_advice(a: &BackpressureAdvisory, b: &BackpressureAdvisory) -> bool {
    a.attention_level == b.attention_level
        && a.system_load == b.system_load
        && a.memory_protection_active == b.memory_protection_active
        && a.paused == b.paused
        && a.recommended_batch_window == b.recommended_batch_window
        && a.recommended_batch_size == b.recommended_batch_size
        && a.load_multiplier == b.load_multiplier
}

/// One `watch` channel per pair that a producer asked advice for.
///
/// Receivers are only woken when the advice itself changes; the stored
/// value's timestamp is refreshed on every pass.
#[derive(Debug)]
pub struct AdvisoryPublisher {
    computer: AdvisoryComputer,
    channels: DashMap<PairKey, watch::Sender<BackpressureAdvisory>>,
}

impl AdvisoryPublisher {
    pub fn new(computer: AdvisoryComputer) -> Self {
        Self {
            computer,
            channels: DashMap::new(),
        }
    }

    pub fn computer(&self) -> &AdvisoryComputer {
        &self.computer
    }

    /// Subscribe to a pair's advisories, starting with the current one.
    pub fn watch(&self, key: &PairKey) -> watch::Receiver<BackpressureAdvisory> {
        if let Some(tx) = self.channels.get(key) {
            return tx.subscribe();
        }
        let advisory = self.computer.compute(key);
        self.channels
            .entry(key.clone())
            .or_insert_with(|| watch::channel(advisory).0)
            .subscribe()
    }

    /// Recompute one pair; returns whether receivers were notified.
    pub fn refresh(&self, key: &PairKey) -> bool {
        if !self.channels.contains_key(key) {
            return false;
        }
        let next = self.computer.compute(key);
        let (level, paused) = (next.attention_level, next.paused);
        let Some(tx) = self.channels.get(key) else {
            return false;
        };
        let changed = tx.send_if_modified(|current| {
            let changed = !same_advice(current, &next);
            *current = next;
            changed
        });
        if changed {
            debug!(pair = %key, level = %level, paused, "Advisory changed");
        }
        changed
    }

    /// Recompute every pair; returns how many changed.
    pub fn refresh_all(&self) -> usize {
        let keys: Vec<PairKey> = self.channels.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.refresh(key)).count()
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before - self.channels.len()
    }

    pub fn forget_sensor(&self, sensor: &SensorId) {
        self.channels.retain(|key, _| &key.sensor_id != sensor);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Refresh on the configured interval and on level changes until `stop`
    /// is set.
    pub async fn run(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut events: broadcast::Receiver<PipelineEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prune();
                    self.refresh_all();
                }
                event = events.recv() => match event {
                    Ok(PipelineEvent::AttentionChanged(changes)) => {
                        for change in &changes {
                            self.refresh(&change.key);
                        }
                    }
                    Ok(PipelineEvent::LoadChanged { .. })
                    | Ok(PipelineEvent::MemoryProtection { .. }) => {
                        self.refresh_all();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Advisory publisher missed events, refreshing all");
                        self.refresh_all();
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

//! Per-consumer delivery.
//!
//! The [`ConsumerLens`] owns one [`ConsumerBuffer`] per attached consumer.
//! Writes only enqueue; a timer task per buffer drains it on the period of
//! its current [`QualityTier`] and hands the batch to the consumer's channel
//! with a single `try_send`. A slow consumer therefore only ever hurts
//! itself: its channel fills up, its tier degrades and its oldest buffered
//! items are dropped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sensoflow::config::LensConfig;
//! use sensoflow::lens::ConsumerLens;
//! use sensoflow::sampler::LoadSample;
//! use sensoflow_types::{Measurement, PairKey};
//! use tokio::sync::watch;
//!
//! # async fn demo() -> Result<(), sensoflow::PipelineError> {
//! let (_load_tx, load_rx) = watch::channel(LoadSample::default());
//! let lens = Arc::new(ConsumerLens::new(LensConfig::default(), load_rx));
//!
//! let (consumer, mut flushes) = lens.attach();
//! lens.subscribe(consumer, &PairKey::new("s1", "hr"))?;
//! lens.write(&Arc::new(Measurement::new("s1", "hr", 72.0)));
//!
//! if let Some(flush) = flushes.recv().await {
//!     println!("{}", flush.to_json().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use sensoflow_signals::{SignalError, SignalSource};
use sensoflow_types::{ConsumerId, LoadLevel, Measurement, PairKey, SensorId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::LensConfig;
use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::sampler::LoadSample;

mod buffer;
mod flush;
mod tier;

pub use buffer::{ConsumerBuffer, FlushOutcome};
pub use flush::Flush;
pub use tier::{next_tier, QualityTier};

use buffer::LensCounters;

/// Point-in-time lens counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LensStats {
    pub consumers: usize,
    pub buffered: usize,
    pub written: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub flushes: u64,
}

/// Registry of consumer buffers.
#[derive(Debug)]
pub struct ConsumerLens {
    config: Arc<LensConfig>,
    buffers: DashMap<ConsumerId, Arc<ConsumerBuffer>>,
    by_sensor: DashMap<SensorId, HashSet<ConsumerId>>,
    next_id: AtomicU64,
    counters: Arc<LensCounters>,
    load: watch::Receiver<LoadSample>,
    events: Option<EventBus>,
}

impl ConsumerLens {
    /// Empty lens whose tier floors follow `load`.
    pub fn new(config: LensConfig, load: watch::Receiver<LoadSample>) -> Self {
        Self {
            config: Arc::new(config),
            buffers: DashMap::new(),
            by_sensor: DashMap::new(),
            next_id: AtomicU64::new(1),
            counters: Arc::new(LensCounters::default()),
            load,
            events: None,
        }
    }

    /// Announce consumers that vanish without being detached.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Tier periods and capacities in effect.
    pub fn config(&self) -> &LensConfig {
        &self.config
    }

    /// Attach a consumer with the configured sink capacity.
    pub fn attach(self: &Arc<Self>) -> (ConsumerId, mpsc::Receiver<Flush>) {
        self.attach_with_capacity(self.config.sink_capacity)
    }

    /// Attach a consumer and start its flush timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach_with_capacity(
        self: &Arc<Self>,
        capacity: usize,
    ) -> (ConsumerId, mpsc::Receiver<Flush>) {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let floor = QualityTier::floor_for(self.load.borrow().level);
        let buffer = Arc::new(ConsumerBuffer::new(
            id,
            tx,
            floor,
            self.config.max_buffered,
            self.counters.clone(),
        ));
        self.buffers.insert(id, buffer.clone());

        tokio::spawn(buffer::run_flush_timer(
            Arc::downgrade(self),
            buffer,
            self.config.clone(),
            self.load.clone(),
        ));

        info!(consumer = %id, capacity, tier = ?floor, "Consumer attached");
        (id, rx)
    }

    /// Whether the consumer still has a buffer.
    pub fn is_attached(&self, consumer: ConsumerId) -> bool {
        self.buffers.contains_key(&consumer)
    }

    /// Buffer of an attached consumer.
    pub fn buffer(&self, consumer: ConsumerId) -> Option<Arc<ConsumerBuffer>> {
        self.buffers.get(&consumer).map(|b| b.clone())
    }

    fn require(&self, consumer: ConsumerId) -> Result<Arc<ConsumerBuffer>, PipelineError> {
        self.buffer(consumer)
            .ok_or(PipelineError::UnknownConsumer(consumer))
    }

    /// Start delivering `key` to the consumer.
    pub fn subscribe(&self, consumer: ConsumerId, key: &PairKey) -> Result<(), PipelineError> {
        let buffer = self.require(consumer)?;
        buffer.subscribe(key.sensor_id.clone(), key.attribute_id.clone());
        self.by_sensor
            .entry(key.sensor_id.clone())
            .or_default()
            .insert(consumer);
        debug!(consumer = %consumer, sensor = %key.sensor_id, attribute = %key.attribute_id, "Subscribed");
        Ok(())
    }

    /// Stop delivering `key` to the consumer.
    pub fn unsubscribe(&self, consumer: ConsumerId, key: &PairKey) -> Result<(), PipelineError> {
        let buffer = self.require(consumer)?;
        if buffer.unsubscribe(&key.sensor_id, &key.attribute_id) {
            self.unindex(&key.sensor_id, consumer);
        }
        Ok(())
    }

    fn unindex(&self, sensor: &SensorId, consumer: ConsumerId) {
        self.by_sensor.remove_if_mut(sensor, |_, consumers| {
            consumers.remove(&consumer);
            consumers.is_empty()
        });
    }

    /// Drop every subscription to `sensor`.
    pub fn remove_sensor(&self, sensor: &SensorId) {
        if let Some((_, consumers)) = self.by_sensor.remove(sensor) {
            for consumer in consumers {
                if let Some(buffer) = self.buffer(consumer) {
                    buffer.unsubscribe_sensor(sensor);
                }
            }
        }
    }

    /// Close a consumer, flushing what is still buffered.
    ///
    /// The final flush happens even when the consumer is paused. A full
    /// channel gets `detach_grace` to make room before the batch counts as
    /// dropped. Returns the number of measurements handed over or queued for
    /// delivery.
    pub fn detach(&self, consumer: ConsumerId) -> Result<usize, PipelineError> {
        let (_, buffer) = self
            .buffers
            .remove(&consumer)
            .ok_or(PipelineError::UnknownConsumer(consumer))?;
        buffer.close();

        let sent = buffer.flush_final(self.config.detach_grace());
        for sensor in buffer.subscribed_sensors() {
            self.unindex(&sensor, consumer);
        }
        info!(consumer = %consumer, flushed = sent, "Consumer detached");
        Ok(sent)
    }

    /// Remove a buffer whose sink went away and announce it.
    pub(crate) fn release(&self, consumer: ConsumerId) {
        if let Some((_, buffer)) = self.buffers.remove(&consumer) {
            buffer.close();
            for sensor in buffer.subscribed_sensors() {
                self.unindex(&sensor, consumer);
            }
            debug!(consumer = %consumer, "Released closed consumer");
            if let Some(events) = &self.events {
                events.emit(PipelineEvent::ConsumerGone { consumer });
            }
        }
    }

    /// Enqueue into every subscribed buffer; returns how many took it.
    pub fn write(&self, measurement: &Arc<Measurement>) -> usize {
        let consumers: Vec<ConsumerId> = match self.by_sensor.get(&measurement.sensor_id) {
            Some(consumers) => consumers.iter().copied().collect(),
            None => return 0,
        };

        consumers
            .into_iter()
            .filter_map(|id| self.buffer(id))
            .filter(|buffer| buffer.write(measurement))
            .count()
    }

    /// Hold back scheduled flushes until unpaused.
    pub fn set_paused(&self, consumer: ConsumerId, paused: bool) -> Result<(), PipelineError> {
        self.require(consumer)?.set_paused(paused);
        debug!(consumer = %consumer, paused, "Pause state changed");
        Ok(())
    }

    /// Current tier of an attached consumer.
    pub fn tier(&self, consumer: ConsumerId) -> Option<QualityTier> {
        self.buffers.get(&consumer).map(|b| b.tier())
    }

    /// Push every buffer down to the floor tier of the new load level.
    pub fn on_load_change(&self, level: LoadLevel) {
        let floor = QualityTier::floor_for(level);
        for entry in self.buffers.iter() {
            if entry.active_tier() < floor {
                entry.set_active_tier(floor);
            }
        }
    }

    /// Remove buffers whose consumer has gone away.
    pub fn sweep(&self) -> usize {
        let closed: Vec<ConsumerId> = self
            .buffers
            .iter()
            .filter(|entry| entry.is_closed())
            .map(|entry| *entry.key())
            .collect();
        for consumer in &closed {
            self.release(*consumer);
        }
        if !closed.is_empty() {
            info!(removed = closed.len(), "Swept closed consumers");
        }
        closed.len()
    }

    /// Number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Snapshot of the shared counters.
    pub fn stats(&self) -> LensStats {
        LensStats {
            consumers: self.buffers.len(),
            buffered: self.buffers.iter().map(|b| b.buffered()).sum(),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }

    /// Mean consumer pressure, or `0.0` with nobody attached.
    pub fn pressure(&self) -> f64 {
        let (sum, count) = self
            .buffers
            .iter()
            .fold((0.0, 0usize), |(sum, count), b| (sum + b.pressure(), count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Queue-pressure signal for the load sampler.
    pub fn queue_pressure(self: &Arc<Self>) -> LensQueuePressure {
        LensQueuePressure {
            lens: Arc::downgrade(self),
        }
    }

    /// Sweep closed consumers every `sweep_interval` until `stop` is set.
    pub async fn run_sweep(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// [`SignalSource`] reporting the lens's mean consumer pressure.
#[derive(Debug, Clone)]
pub struct LensQueuePressure {
    lens: Weak<ConsumerLens>,
}

impl SignalSource for LensQueuePressure {
    fn name(&self) -> &str {
        "queue"
    }

    fn sample(&self) -> Result<f64, SignalError> {
        self.lens
            .upgrade()
            .map(|lens| lens.pressure())
            .ok_or_else(|| SignalError::Unavailable("consumer lens dropped".to_string()))
    }
}

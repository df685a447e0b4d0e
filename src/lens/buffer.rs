//! Per-consumer buffers and their flush timers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sensoflow_types::{AttributeId, ConsumerId, Measurement, SensorId};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

use super::{ConsumerLens, Flush, QualityTier};
use crate::config::LensConfig;
use crate::sampler::LoadSample;

/// Totals shared by every buffer of a lens.
#[derive(Debug, Default)]
pub(crate) struct LensCounters {
    pub written: AtomicU64,
    pub dropped: AtomicU64,
    pub flushed: AtomicU64,
    pub flushes: AtomicU64,
}

impl LensCounters {
    fn record_sent(&self, count: usize) {
        self.flushed.fetch_add(count as u64, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<Arc<Measurement>>,
    sequence: u64,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Empty,
    /// A batch of this many measurements was handed to the sink.
    Sent(usize),
    /// The sink is full; the batch stays buffered.
    Full,
    /// The consumer is gone.
    Closed,
}

/// FIFO buffer for one connected consumer.
#[derive(Debug)]
pub struct ConsumerBuffer {
    id: ConsumerId,
    queue: Mutex<Queue>,
    subscriptions: RwLock<HashMap<SensorId, HashSet<AttributeId>>>,
    tier: AtomicU8,
    paused: AtomicBool,
    closed: AtomicBool,
    sink: mpsc::Sender<Flush>,
    wake: Notify,
    max_buffered: usize,
    counters: Arc<LensCounters>,
}

impl ConsumerBuffer {
    pub(crate) fn new(
        id: ConsumerId,
        sink: mpsc::Sender<Flush>,
        tier: QualityTier,
        max_buffered: usize,
        counters: Arc<LensCounters>,
    ) -> Self {
        Self {
            id,
            queue: Mutex::new(Queue::default()),
            subscriptions: RwLock::new(HashMap::new()),
            tier: AtomicU8::new(tier.to_u8()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sink,
            wake: Notify::new(),
            max_buffered: max_buffered.max(1),
            counters,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Current tier, `Paused` while paused.
    pub fn tier(&self) -> QualityTier {
        if self.paused.load(Ordering::Acquire) {
            QualityTier::Paused
        } else {
            self.active_tier()
        }
    }

    /// Tier used whenever the buffer is not paused.
    pub fn active_tier(&self) -> QualityTier {
        QualityTier::from_u8(self.tier.load(Ordering::Acquire))
    }

    pub fn buffered(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sink.is_closed()
    }

    /// Fraction of the outbound channel currently occupied.
    pub fn fill_ratio(&self) -> f64 {
        let max = self.sink.max_capacity();
        if max == 0 {
            return 0.0;
        }
        (max - self.sink.capacity()) as f64 / max as f64
    }

    /// Pressure this consumer puts on the node, in `[0, 1]`.
    pub fn pressure(&self) -> f64 {
        let queued = self.buffered() as f64 / self.max_buffered as f64;
        self.fill_ratio().max(queued).min(1.0)
    }

    pub(crate) fn subscribe(&self, sensor: SensorId, attribute: AttributeId) {
        self.subscriptions
            .write()
            .entry(sensor)
            .or_default()
            .insert(attribute);
    }

    /// Returns `true` when no attribute of `sensor` remains subscribed.
    pub(crate) fn unsubscribe(&self, sensor: &SensorId, attribute: &AttributeId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(attributes) = subscriptions.get_mut(sensor) else {
            return true;
        };
        attributes.remove(attribute);
        if attributes.is_empty() {
            subscriptions.remove(sensor);
            true
        } else {
            false
        }
    }

    pub(crate) fn unsubscribe_sensor(&self, sensor: &SensorId) {
        self.subscriptions.write().remove(sensor);
    }

    pub(crate) fn subscribed_sensors(&self) -> Vec<SensorId> {
        self.subscriptions.read().keys().cloned().collect()
    }

    pub fn is_subscribed(&self, sensor: &SensorId, attribute: &AttributeId) -> bool {
        self.subscriptions
            .read()
            .get(sensor)
            .is_some_and(|attributes| attributes.contains(attribute))
    }

    /// Enqueue if subscribed; returns whether the measurement was taken.
    pub(crate) fn write(&self, measurement: &Arc<Measurement>) -> bool {
        if self.closed.load(Ordering::Acquire)
            || !self.is_subscribed(&measurement.sensor_id, &measurement.attribute_id)
        {
            return false;
        }

        let mut queue = self.queue.lock();
        queue.items.push_back(measurement.clone());
        self.counters.written.fetch_add(1, Ordering::Relaxed);
        while queue.items.len() > self.max_buffered {
            queue.items.pop_front();
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn drain(&self, queue: &mut Queue) -> Flush {
        Flush {
            consumer_id: self.id,
            sequence: queue.sequence,
            tier: self.tier(),
            timestamp: sensoflow_types::current_timestamp_ms(),
            measurements: queue.items.drain(..).collect(),
        }
    }

    /// Drain everything and offer it to the sink once.
    pub(crate) fn flush(&self) -> FlushOutcome {
        let mut queue = self.queue.lock();
        if queue.items.is_empty() {
            return FlushOutcome::Empty;
        }

        let flush = self.drain(&mut queue);
        let count = flush.len();

        match self.sink.try_send(flush) {
            Ok(()) => {
                queue.sequence += 1;
                self.counters.record_sent(count);
                FlushOutcome::Sent(count)
            }
            Err(TrySendError::Full(flush)) => {
                // Writers wait on the queue lock, so nothing can have been
                // appended since the drain and the order is unchanged.
                queue.items = flush.measurements.into();
                FlushOutcome::Full
            }
            Err(TrySendError::Closed(_)) => FlushOutcome::Closed,
        }
    }

    /// Hand the last batch of a detached consumer to its sink.
    ///
    /// A full sink gets up to `grace` to make room; the wait runs on a
    /// spawned task when a runtime is available. Whatever cannot be
    /// delivered is counted as dropped. Returns the number of measurements
    /// sent or queued for sending.
    pub(crate) fn flush_final(&self, grace: Duration) -> usize {
        let flush = {
            let mut queue = self.queue.lock();
            if queue.items.is_empty() {
                return 0;
            }
            let flush = self.drain(&mut queue);
            queue.sequence += 1;
            flush
        };
        let count = flush.len();

        let flush = match self.sink.try_send(flush) {
            Ok(()) => {
                self.counters.record_sent(count);
                return count;
            }
            Err(TrySendError::Full(flush)) => flush,
            Err(TrySendError::Closed(_)) => {
                self.counters.record_dropped(count);
                debug!(consumer = %self.id, dropped = count, "Final batch lost, consumer gone");
                return 0;
            }
        };

        let Ok(runtime) = Handle::try_current() else {
            self.counters.record_dropped(count);
            warn!(consumer = %self.id, dropped = count, "Final batch dropped, sink full");
            return 0;
        };

        let sink = self.sink.clone();
        let counters = self.counters.clone();
        let consumer = self.id;
        runtime.spawn(async move {
            match tokio::time::timeout(grace, sink.send(flush)).await {
                Ok(Ok(())) => counters.record_sent(count),
                Ok(Err(_)) | Err(_) => {
                    counters.record_dropped(count);
                    warn!(consumer = %consumer, dropped = count, "Final batch dropped, sink stayed full");
                }
            }
        });
        count
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::AcqRel) != paused {
            self.wake.notify_one();
        }
    }

    pub(crate) fn set_active_tier(&self, tier: QualityTier) {
        if tier == QualityTier::Paused {
            return;
        }
        let previous = self.tier.swap(tier.to_u8(), Ordering::AcqRel);
        if previous != tier.to_u8() {
            trace!(consumer = %self.id, tier = ?tier, "Tier changed");
            self.wake.notify_one();
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// Flush a buffer on its tier's period until it is closed.
///
/// Only this task flushes the buffer on a schedule, so at most one flush is
/// ever pending. A tier change wakes the task and restarts the wait.
pub(crate) async fn run_flush_timer(
    lens: Weak<ConsumerLens>,
    buffer: Arc<ConsumerBuffer>,
    config: Arc<LensConfig>,
    load: watch::Receiver<LoadSample>,
) {
    loop {
        if buffer.is_closed() {
            break;
        }

        match buffer.tier().period(&config.tiers) {
            None => {
                tokio::select! {
                    _ = buffer.wake.notified() => {}
                    _ = buffer.sink.closed() => break,
                }
            }
            Some(period) => {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if buffer.flush() == FlushOutcome::Closed {
                            break;
                        }
                        if buffer.tier() != QualityTier::Paused {
                            let floor = QualityTier::floor_for(load.borrow().level);
                            let next = super::tier::next_tier(
                                buffer.active_tier(),
                                floor,
                                buffer.fill_ratio(),
                                config.degrade_fill,
                                config.recover_fill,
                            );
                            buffer.set_active_tier(next);
                        }
                    }
                    _ = buffer.wake.notified() => {}
                    _ = buffer.sink.closed() => break,
                }
            }
        }
    }

    debug!(consumer = %buffer.id(), "Flush timer stopped");
    if let Some(lens) = lens.upgrade() {
        lens.release(buffer.id());
    }
}

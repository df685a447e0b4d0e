//! Load sampling and classification.
//!
//! The [`LoadSampler`] periodically reads four pressure signals (CPU,
//! outbound queue, memory, run queue), blends them with configured weights
//! and classifies the blend into a [`LoadLevel`]. The latest
//! [`LoadSample`] is published on a `watch` channel that every other
//! component reads without blocking.
//!
//! Thresholds live in [`SharedThresholds`] so the homeostatic controller
//! can nudge them at runtime.

use std::sync::Arc;

use parking_lot::RwLock;
use sensoflow_signals::SignalSource;
use sensoflow_types::LoadLevel;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{LoadThresholds, SamplerConfig};
use crate::events::{EventBus, PipelineEvent};

/// Smallest gap kept between adjacent thresholds.
const THRESHOLD_GAP: f64 = 0.01;

/// Raw pressure readings from one sampling round. `None` means the source
/// failed and contributed zero pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalReadings {
    pub cpu: Option<f64>,
    pub queue: Option<f64>,
    pub memory: Option<f64>,
    pub run_queue: Option<f64>,
}

/// The sampler's view of system load at one instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadSample {
    pub level: LoadLevel,
    pub blend: f64,
    pub readings: SignalReadings,
    pub memory_protection: bool,
}

impl LoadSample {
    /// A sample with only a level set.
    pub fn at(level: LoadLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Same sample with memory protection switched on or off.
    pub fn with_memory_protection(mut self, active: bool) -> Self {
        self.memory_protection = active;
        self
    }
}

/// Load thresholds that can be adjusted while the sampler runs.
///
/// Adjustments always leave the thresholds strictly ascending and inside
/// `[min, max]`.
#[derive(Debug)]
pub struct SharedThresholds {
    inner: RwLock<LoadThresholds>,
    min: f64,
    max: f64,
}

impl SharedThresholds {
    pub fn new(initial: LoadThresholds, min: f64, max: f64) -> Self {
        let shared = Self {
            inner: RwLock::new(initial),
            min,
            max,
        };
        let normalized = shared.normalize(initial.as_array());
        *shared.inner.write() = LoadThresholds::from_array(normalized);
        shared
    }

    pub fn get(&self) -> LoadThresholds {
        *self.inner.read()
    }

    /// Add `deltas` to (elevated, high, critical) and return the result.
    pub fn adjust(&self, deltas: [f64; 3]) -> LoadThresholds {
        let mut inner = self.inner.write();
        let mut values = inner.as_array();
        for (value, delta) in values.iter_mut().zip(deltas) {
            if delta.is_finite() {
                *value += delta;
            }
        }
        *inner = LoadThresholds::from_array(self.normalize(values));
        *inner
    }

    fn normalize(&self, mut values: [f64; 3]) -> [f64; 3] {
        for value in values.iter_mut() {
            *value = value.clamp(self.min, self.max);
        }
        for i in 1..values.len() {
            if values[i] < values[i - 1] + THRESHOLD_GAP {
                values[i] = values[i - 1] + THRESHOLD_GAP;
            }
        }
        // pushed past the ceiling: walk back down from the top
        values[2] = values[2].min(self.max);
        values[1] = values[1].min(values[2] - THRESHOLD_GAP);
        values[0] = values[0].min(values[1] - THRESHOLD_GAP);
        values
    }
}

/// Classify a blend, optionally holding the previous level until the blend
/// falls `hysteresis` below the threshold that was crossed.
pub fn classify(
    blend: f64,
    thresholds: &LoadThresholds,
    previous: LoadLevel,
    hysteresis: f64,
) -> LoadLevel {
    let raw = LoadLevel::ALL
        .into_iter()
        .rev()
        .find(|level| {
            thresholds
                .for_level(*level)
                .map_or(true, |threshold| blend >= threshold)
        })
        .unwrap_or(LoadLevel::Normal);

    if raw >= previous || hysteresis <= 0.0 {
        return raw;
    }

    let mut level = previous;
    while level > raw {
        match thresholds.for_level(level) {
            Some(threshold) if blend < threshold - hysteresis => {
                level = LoadLevel::from_index(level.index() - 1);
            }
            _ => break,
        }
    }
    level
}

/// The four signal sources feeding the sampler.
#[derive(Debug)]
pub struct LoadSignals {
    pub cpu: Box<dyn SignalSource>,
    pub queue: Box<dyn SignalSource>,
    pub memory: Box<dyn SignalSource>,
    pub run_queue: Box<dyn SignalSource>,
}

impl LoadSignals {
    /// Host signals from procfs plus the given queue-pressure source.
    pub fn system(queue: Box<dyn SignalSource>) -> Self {
        Self {
            cpu: Box::new(sensoflow_signals::ProcCpu::new()),
            queue,
            memory: Box::new(sensoflow_signals::ProcMemory::new()),
            run_queue: Box::new(sensoflow_signals::ProcRunQueue::new()),
        }
    }

    fn read(&self) -> SignalReadings {
        SignalReadings {
            cpu: read_signal(self.cpu.as_ref()),
            queue: read_signal(self.queue.as_ref()),
            memory: read_signal(self.memory.as_ref()),
            run_queue: read_signal(self.run_queue.as_ref()),
        }
    }
}

fn read_signal(source: &dyn SignalSource) -> Option<f64> {
    match source.sample() {
        Ok(value) => Some(sensoflow_signals::clamp_pressure(value)),
        Err(e) => {
            debug!(signal = source.name(), error = %e, "Signal unavailable");
            None
        }
    }
}

/// Periodic load classifier.
#[derive(Debug)]
pub struct LoadSampler {
    signals: LoadSignals,
    config: SamplerConfig,
    thresholds: Arc<SharedThresholds>,
    tx: watch::Sender<LoadSample>,
    events: EventBus,
}

impl LoadSampler {
    pub fn new(
        signals: LoadSignals,
        config: SamplerConfig,
        thresholds: Arc<SharedThresholds>,
        events: EventBus,
    ) -> Self {
        let (tx, _) = watch::channel(LoadSample::default());
        Self::with_publisher(signals, config, thresholds, events, tx)
    }

    /// Publish samples on an existing channel, so readers can be wired up
    /// before the sampler exists.
    pub fn with_publisher(
        signals: LoadSignals,
        config: SamplerConfig,
        thresholds: Arc<SharedThresholds>,
        events: EventBus,
        tx: watch::Sender<LoadSample>,
    ) -> Self {
        Self {
            signals,
            config,
            thresholds,
            tx,
            events,
        }
    }

    /// Receive every published sample.
    pub fn subscribe(&self) -> watch::Receiver<LoadSample> {
        self.tx.subscribe()
    }

    /// The most recently published sample.
    pub fn current(&self) -> LoadSample {
        self.tx.borrow().clone()
    }

    pub fn thresholds(&self) -> &Arc<SharedThresholds> {
        &self.thresholds
    }

    /// Weighted average of the readings; a missing reading counts as idle.
    pub fn blend(&self, readings: &SignalReadings) -> f64 {
        let weights = &self.config.weights;
        let parts = [
            (readings.cpu, weights.cpu),
            (readings.queue, weights.queue),
            (readings.memory, weights.memory),
            (readings.run_queue, weights.run_queue),
        ];

        let (sum, total) = parts.iter().fold((0.0, 0.0), |(sum, total), (value, weight)| {
            let weight = weight.max(0.0);
            (sum + value.unwrap_or(0.0) * weight, total + weight)
        });

        if total > 0.0 {
            sensoflow_signals::clamp_pressure(sum / total)
        } else {
            0.0
        }
    }

    /// Take one sample, publish it and report transitions.
    pub fn sample(&self) -> LoadSample {
        let readings = self.signals.read();
        let blend = self.blend(&readings);
        let previous = self.current();

        let level = classify(
            blend,
            &self.thresholds.get(),
            previous.level,
            self.config.hysteresis,
        );
        let memory_protection = readings
            .memory
            .is_some_and(|m| m >= self.config.memory_protection_threshold);

        let sample = LoadSample {
            level,
            blend,
            readings,
            memory_protection,
        };
        self.tx.send_replace(sample.clone());

        if level != previous.level {
            info!(
                previous = %previous.level,
                current = %level,
                blend,
                "Load level changed"
            );
            self.events.emit(PipelineEvent::LoadChanged {
                previous: previous.level,
                current: level,
                blend,
            });
        }
        if memory_protection != previous.memory_protection {
            if memory_protection {
                warn!(memory = ?readings.memory, "Memory protection engaged");
            } else {
                info!("Memory protection released");
            }
            self.events.emit(PipelineEvent::MemoryProtection {
                active: memory_protection,
            });
        }

        sample
    }

    /// Sample on the configured interval until `stop` flips to `true`.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sample();
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

#[cfg(test)]
mod tests {
    use super::*;
    use sensoflow_signals::FixedSignal;

    struct Rig {
        cpu: FixedSignal,
        queue: FixedSignal,
        memory: FixedSignal,
        run_queue: FixedSignal,
    }

    fn rig(config: SamplerConfig) -> (Rig, LoadSampler) {
        let rig = Rig {
            cpu: FixedSignal::new("cpu", 0.0),
            queue: FixedSignal::new("queue", 0.0),
            memory: FixedSignal::new("memory", 0.0),
            run_queue: FixedSignal::new("run_queue", 0.0),
        };
        let signals = LoadSignals {
            cpu: Box::new(rig.cpu.clone()),
            queue: Box::new(rig.queue.clone()),
            memory: Box::new(rig.memory.clone()),
            run_queue: Box::new(rig.run_queue.clone()),
        };
        let thresholds = Arc::new(SharedThresholds::new(config.thresholds, 0.05, 0.99));
        let sampler = LoadSampler::new(signals, config, thresholds, EventBus::default());
        (rig, sampler)
    }

    fn set_all(rig: &Rig, value: f64) {
        rig.cpu.set(value);
        rig.queue.set(value);
        rig.memory.set(value);
        rig.run_queue.set(value);
    }

    #[test]
    fn blend_is_weighted_average() {
        let (rig, sampler) = rig(SamplerConfig::default());
        rig.cpu.set(1.0);
        let sample = sampler.sample();
        assert!((sample.blend - 0.45).abs() < 1e-9);
    }

    #[test]
    fn unavailable_signals_count_as_idle() {
        let (rig, sampler) = rig(SamplerConfig::default());
        rig.cpu.set(0.8);
        rig.queue.clear();
        rig.memory.clear();
        rig.run_queue.clear();
        let sample = sampler.sample();
        assert!((sample.blend - 0.36).abs() < 1e-9);
        assert_eq!(sample.readings.queue, None);
        assert!(!sample.memory_protection);
    }

    #[test]
    fn all_unavailable_is_normal() {
        let (rig, sampler) = rig(SamplerConfig::default());
        rig.cpu.clear();
        rig.queue.clear();
        rig.memory.clear();
        rig.run_queue.clear();
        assert_eq!(sampler.sample().level, LoadLevel::Normal);
    }

    #[test]
    fn classify_uses_thresholds() {
        let t = LoadThresholds::default();
        assert_eq!(classify(0.1, &t, LoadLevel::Normal, 0.0), LoadLevel::Normal);
        assert_eq!(classify(0.5, &t, LoadLevel::Normal, 0.0), LoadLevel::Elevated);
        assert_eq!(classify(0.75, &t, LoadLevel::Normal, 0.0), LoadLevel::High);
        assert_eq!(classify(0.9, &t, LoadLevel::Normal, 0.0), LoadLevel::Critical);
        assert_eq!(classify(0.1, &t, LoadLevel::Critical, 0.0), LoadLevel::Normal);
    }

    #[test]
    fn hysteresis_delays_downward_transitions_only() {
        let t = LoadThresholds::default();
        // just under critical: held
        assert_eq!(classify(0.82, &t, LoadLevel::Critical, 0.05), LoadLevel::Critical);
        // well under critical but still above high - h: drops one level
        assert_eq!(classify(0.79, &t, LoadLevel::Critical, 0.05), LoadLevel::High);
        // far below everything: drops all the way
        assert_eq!(classify(0.1, &t, LoadLevel::Critical, 0.05), LoadLevel::Normal);
        // upward is immediate
        assert_eq!(classify(0.86, &t, LoadLevel::Normal, 0.05), LoadLevel::Critical);
    }

    #[test]
    fn sample_publishes_and_emits_transitions() {
        let (rig, sampler) = rig(SamplerConfig::default());
        let mut events = sampler.events.subscribe();
        let rx = sampler.subscribe();

        set_all(&rig, 0.9);
        let sample = sampler.sample();
        assert_eq!(sample.level, LoadLevel::Critical);
        assert!(sample.memory_protection);
        assert_eq!(rx.borrow().level, LoadLevel::Critical);

        assert!(matches!(
            events.try_recv().unwrap(),
            PipelineEvent::LoadChanged {
                previous: LoadLevel::Normal,
                current: LoadLevel::Critical,
                ..
            }
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            PipelineEvent::MemoryProtection { active: true }
        );

        // unchanged sample emits nothing
        sampler.sample();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn memory_protection_follows_memory_signal_alone() {
        let (rig, sampler) = rig(SamplerConfig::default());
        rig.memory.set(0.9);
        let sample = sampler.sample();
        assert_eq!(sample.level, LoadLevel::Normal);
        assert!(sample.memory_protection);
    }

    #[test]
    fn shared_thresholds_stay_ordered() {
        let shared = SharedThresholds::new(LoadThresholds::default(), 0.05, 0.99);
        let t = shared.adjust([0.5, 0.0, 0.0]);
        assert!(t.elevated < t.high && t.high < t.critical);
        assert!(t.critical <= 0.99);

        let t = shared.adjust([-2.0, -2.0, -2.0]);
        assert!(t.elevated >= 0.05);
        assert!(t.elevated < t.high && t.high < t.critical);

        let t = shared.adjust([5.0, 5.0, 5.0]);
        assert!(t.critical <= 0.99);
        assert!(t.elevated < t.high && t.high < t.critical);
    }

    #[tokio::test(start_paused = true)]
    async fn run_samples_until_stopped() {
        let (rig, sampler) = rig(SamplerConfig {
            interval_ms: 100,
            ..SamplerConfig::default()
        });
        let sampler = Arc::new(sampler);
        let mut rx = sampler.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sampler.clone().run(stop_rx));

        set_all(&rig, 0.6);
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().level, LoadLevel::Elevated);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}

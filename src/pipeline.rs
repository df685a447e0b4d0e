//! The assembled pipeline.
//!
//! [`Pipeline`] wires every component together and exposes the operations
//! producers and consumers use. Building a pipeline does not start any
//! background work; [`Pipeline::start`] spawns the supervised loops and
//! returns a [`PipelineHandle`] that stops them.
//!
//! ```text
//! producer ─▶ ingest ─▶ store
//!                  ├──▶ novelty ─▶ arbiter
//!                  └──▶ ShardedBus ─▶ Router ─▶ ConsumerLens ─▶ Flush
//!                             └─ raw ─▶ SynchronyComputer
//! sampler ─▶ LoadSample ─▶ tracker · store · lens · advisories
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use sensoflow::{Pipeline, ViewRequest};
//! use sensoflow_types::AttentionLevel;
//!
//! # async fn demo() -> Result<(), sensoflow::PipelineError> {
//! let pipeline = Pipeline::builder().build()?;
//! let handle = pipeline.start();
//!
//! let (consumer, mut flushes) = pipeline.connect_consumer();
//! pipeline.register_view(consumer, ViewRequest::new("s1", "hr", AttentionLevel::High))?;
//!
//! let producer = pipeline.producer("s1");
//! let advice = producer.advisories("hr");
//! producer.publish("hr", 72.0)?;
//!
//! if let Some(flush) = flushes.recv().await {
//!     println!("{} measurements at {:?}", flush.len(), advice.borrow().recommended_batch_window);
//! }
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sensoflow_signals::SignalSource;
use sensoflow_types::{
    AttentionLevel, AttributeId, BackpressureAdvisory, ConsumerId, Measurement, Millis, PairKey,
    Payload, SensorId,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::advisory::{AdvisoryComputer, AdvisoryPublisher};
use crate::config::PipelineConfig;
use crate::controllers::{
    CircadianScheduler, Controller, ControllerSet, HomeostaticController, NoveltyDetector,
    PredictiveBalancer, ResourceArbiter,
};
use crate::error::PipelineError;
use crate::events::{AttentionChange, Component, EventBus, PipelineEvent};
use crate::interest::{run_interest_worker, AttentionView, InterestTracker};
use crate::lens::{ConsumerLens, Flush, LensStats};
use crate::router::{Router, ShardedBus};
use crate::sampler::{LoadSample, LoadSampler, LoadSignals, SharedThresholds};
use crate::store::{StoreStats, TieredStore};
use crate::supervisor::spawn_supervised;
use crate::synchrony::{SynchronyComputer, SynchronyGroup, SynchronyReading};

/// A consumer's request to watch one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRequest {
    pub key: PairKey,
    pub priority: AttentionLevel,
    /// Device energy ceiling; the effective level never exceeds it.
    pub energy_ceiling: Option<AttentionLevel>,
}

impl ViewRequest {
    pub fn new(
        sensor_id: impl Into<SensorId>,
        attribute_id: impl Into<AttributeId>,
        priority: AttentionLevel,
    ) -> Self {
        Self {
            key: PairKey::new(sensor_id, attribute_id),
            priority,
            energy_ceiling: None,
        }
    }

    pub fn with_ceiling(mut self, ceiling: AttentionLevel) -> Self {
        self.energy_ceiling = Some(ceiling);
        self
    }

    fn into_view(self, consumer: ConsumerId) -> AttentionView {
        let view = AttentionView::new(consumer.into(), self.key, self.priority);
        match self.energy_ceiling {
            Some(ceiling) => view.with_ceiling(ceiling),
            None => view,
        }
    }
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStats {
    pub load: LoadSample,
    pub store: StoreStats,
    pub lens: LensStats,
    /// Viewed pairs per attention level, indexed by [`AttentionLevel::index`].
    pub attention: [usize; 4],
    pub active_shards: Vec<AttentionLevel>,
}

/// Builder for [`Pipeline`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    cpu: Option<Box<dyn SignalSource>>,
    queue: Option<Box<dyn SignalSource>>,
    memory: Option<Box<dyn SignalSource>>,
    run_queue: Option<Box<dyn SignalSource>>,
    controllers: Vec<Arc<dyn Controller>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Load configuration from an optional TOML file plus environment.
    pub fn config_file(mut self, path: Option<&Path>) -> Result<Self, PipelineError> {
        self.config = PipelineConfig::load(path)?;
        Ok(self)
    }

    pub fn cpu_signal(mut self, source: impl SignalSource + 'static) -> Self {
        self.cpu = Some(Box::new(source));
        self
    }

    /// Replace the default queue signal (mean consumer pressure).
    pub fn queue_signal(mut self, source: impl SignalSource + 'static) -> Self {
        self.queue = Some(Box::new(source));
        self
    }

    pub fn memory_signal(mut self, source: impl SignalSource + 'static) -> Self {
        self.memory = Some(Box::new(source));
        self
    }

    pub fn run_queue_signal(mut self, source: impl SignalSource + 'static) -> Self {
        self.run_queue = Some(Box::new(source));
        self
    }

    /// Add a controller after the built-in ones.
    pub fn controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        let config = self.config;

        let events = EventBus::default();
        let (load_tx, load_rx) = watch::channel(LoadSample::default());
        let thresholds = Arc::new(SharedThresholds::new(
            config.sampler.thresholds,
            config.controllers.homeostatic.min_threshold,
            config.controllers.homeostatic.max_threshold,
        ));

        let lens = Arc::new(
            ConsumerLens::new(config.lens.clone(), load_rx.clone()).with_events(events.clone()),
        );
        let signals = LoadSignals {
            cpu: self
                .cpu
                .unwrap_or_else(|| Box::new(sensoflow_signals::ProcCpu::new())),
            queue: self
                .queue
                .unwrap_or_else(|| Box::new(lens.queue_pressure())),
            memory: self
                .memory
                .unwrap_or_else(|| Box::new(sensoflow_signals::ProcMemory::new())),
            run_queue: self
                .run_queue
                .unwrap_or_else(|| Box::new(sensoflow_signals::ProcRunQueue::new())),
        };
        let sampler = Arc::new(LoadSampler::with_publisher(
            signals,
            config.sampler.clone(),
            thresholds.clone(),
            events.clone(),
            load_tx,
        ));

        let cfg = &config.controllers;
        let mut controllers = ControllerSet::new(cfg.factor_min, cfg.factor_max);
        let novelty = cfg
            .novelty
            .enabled
            .then(|| Arc::new(NoveltyDetector::new(cfg.novelty.clone())));
        let arbiter = cfg
            .arbiter
            .enabled
            .then(|| Arc::new(ResourceArbiter::new(cfg.arbiter.clone())));
        if let Some(novelty) = &novelty {
            controllers.push(novelty.clone());
        }
        if let Some(arbiter) = &arbiter {
            controllers.push(arbiter.clone());
        }
        if cfg.homeostatic.enabled {
            controllers.push(Arc::new(HomeostaticController::new(
                cfg.homeostatic.clone(),
                thresholds.clone(),
            )));
        }
        if cfg.circadian.enabled {
            controllers.push(Arc::new(CircadianScheduler::new(cfg.circadian.clone())));
        }
        if cfg.predictive.enabled {
            controllers.push(Arc::new(PredictiveBalancer::new(cfg.predictive.clone())));
        }
        for controller in self.controllers {
            controllers.push(controller);
        }
        debug!(controllers = ?controllers.names(), "Controllers assembled");

        let tracker = Arc::new(InterestTracker::new(
            &config,
            controllers,
            load_rx.clone(),
            events.clone(),
        ));
        let store = Arc::new(TieredStore::new(config.store.clone(), load_rx));
        let bus = Arc::new(ShardedBus::new(&config.router));
        let router = Arc::new(Router::new(bus.clone(), lens.clone(), tracker.clone()));
        let advisories = Arc::new(AdvisoryPublisher::new(AdvisoryComputer::new(
            tracker.clone(),
            config.advisory.clone(),
        )));
        let (stop_tx, _) = watch::channel(false);

        Ok(Pipeline {
            shared: Arc::new(Shared {
                config,
                events,
                sampler,
                tracker,
                store,
                lens,
                bus,
                router,
                advisories,
                novelty,
                arbiter,
                synchrony: Mutex::new(Vec::new()),
                stop_tx,
                started: AtomicBool::new(false),
            }),
        })
    }
}

#[derive(Debug)]
struct Shared {
    config: PipelineConfig,
    events: EventBus,
    sampler: Arc<LoadSampler>,
    tracker: Arc<InterestTracker>,
    store: Arc<TieredStore>,
    lens: Arc<ConsumerLens>,
    bus: Arc<ShardedBus>,
    router: Arc<Router>,
    advisories: Arc<AdvisoryPublisher>,
    novelty: Option<Arc<NoveltyDetector>>,
    arbiter: Option<Arc<ResourceArbiter>>,
    synchrony: Mutex<Vec<Arc<SynchronyComputer>>>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl Shared {
    fn ingest(&self, batch: Vec<Measurement>) -> Result<usize, PipelineError> {
        if *self.stop_tx.borrow() {
            return Err(PipelineError::Closed);
        }
        if batch.is_empty() {
            return Ok(0);
        }
        let now = crate::clock_now();
        let measurements: Vec<Arc<Measurement>> = batch.into_iter().map(Arc::new).collect();

        if let Some(novelty) = &self.novelty {
            let mut grouped: BTreeMap<PairKey, Vec<f64>> = BTreeMap::new();
            for measurement in &measurements {
                grouped
                    .entry(measurement.key())
                    .or_default()
                    .extend_from_slice(measurement.values());
            }
            for (key, values) in grouped {
                if let Some(event) = novelty.observe(&key, &values, now) {
                    info!(
                        sensor = %key.sensor_id,
                        attribute = %key.attribute_id,
                        z_score = event.z_score,
                        "Novel measurement"
                    );
                    if let Some(arbiter) = &self.arbiter {
                        arbiter.note_novelty(&key, event.z_score, now);
                    }
                    self.events.emit(PipelineEvent::Novelty(event));
                }
            }
        }

        let count = measurements.len();
        for measurement in measurements {
            self.store.insert(measurement.clone());
            let level = self.tracker.attention_level_at(&measurement.key(), now);
            self.bus.publish(measurement, level);
        }
        Ok(count)
    }

    fn release_sensor(&self, sensor: &SensorId) {
        let stored = self.store.remove_sensor(sensor);
        let changes = self.tracker.remove_sensor(sensor);
        self.lens.remove_sensor(sensor);
        self.advisories.forget_sensor(sensor);
        for computer in self.synchrony.lock().iter() {
            computer.forget_sensor(sensor);
        }
        self.router.reconcile();
        self.events.emit(PipelineEvent::SensorRetired {
            sensor_id: sensor.clone(),
        });
        info!(sensor = %sensor, pairs = stored, views = changes.len(), "Sensor released");
    }

    /// Drop the views of a consumer whose buffer is already gone.
    fn forget_consumer(&self, consumer: ConsumerId) {
        let changes = self.tracker.disconnect(consumer.into());
        self.router.reconcile();
        debug!(consumer = %consumer, changes = changes.len(), "Dropped views of vanished consumer");
    }

    /// Forget every view holder that no longer has a lens buffer.
    fn reap_vanished_consumers(&self) -> usize {
        let vanished: Vec<ConsumerId> = self
            .tracker
            .table()
            .connections()
            .into_iter()
            .map(|connection| ConsumerId(connection.0))
            .filter(|consumer| !self.lens.is_attached(*consumer))
            .collect();
        for consumer in &vanished {
            self.forget_consumer(*consumer);
        }
        vanished.len()
    }

    /// Drop idle unwatched pairs, then release sensors left with nothing.
    fn retire_idle(&self, now: Instant) -> Vec<SensorId> {
        let idle = self
            .store
            .idle_pairs(self.config.maintenance.sensor_idle_timeout(), now);
        if idle.is_empty() {
            return Vec::new();
        }

        let table = self.tracker.table();
        let watched: BTreeSet<SensorId> = table
            .snapshot(now)
            .into_keys()
            .filter(|key| table.viewers(key) > 0)
            .map(|key| key.sensor_id)
            .collect();

        let mut candidates = BTreeSet::new();
        for key in idle {
            if table.viewers(&key) == 0 {
                self.store.remove_pair(&key);
                debug!(sensor = %key.sensor_id, attribute = %key.attribute_id, "Retired idle pair");
                candidates.insert(key.sensor_id);
            }
        }

        let retired: Vec<SensorId> = candidates
            .into_iter()
            .filter(|sensor| !watched.contains(sensor) && !self.store.has_sensor(sensor))
            .collect();
        for sensor in &retired {
            self.release_sensor(sensor);
        }
        retired
    }
}

async fn run_maintenance(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<PipelineEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let period = shared.config.maintenance.interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = shared.reap_vanished_consumers();
                if reaped > 0 {
                    info!(consumers = reaped, "Dropped views of vanished consumers");
                }
                let retired = shared.retire_idle(crate::clock_now());
                if !retired.is_empty() {
                    info!(sensors = retired.len(), "Retired idle sensors");
                }
            }
            event = events.recv() => match event {
                Ok(PipelineEvent::LoadChanged { current, .. }) => {
                    shared.lens.on_load_change(current);
                }
                Ok(PipelineEvent::ConsumerGone { consumer }) => {
                    shared.forget_consumer(consumer);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Maintenance missed events");
                    shared.lens.on_load_change(shared.tracker.load().level);
                    shared.reap_vanished_consumers();
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

/// Attention-driven backpressure and routing for sensor telemetry.
#[derive(Debug)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Build with host signals and the given configuration.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn tracker(&self) -> &Arc<InterestTracker> {
        &self.shared.tracker
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.shared.store
    }

    pub fn lens(&self) -> &Arc<ConsumerLens> {
        &self.shared.lens
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }

    pub fn sampler(&self) -> &Arc<LoadSampler> {
        &self.shared.sampler
    }

    pub fn arbiter(&self) -> Option<&Arc<ResourceArbiter>> {
        self.shared.arbiter.as_ref()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    pub fn load(&self) -> LoadSample {
        self.shared.tracker.load()
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Attach a consumer. Must be called from within a tokio runtime.
    pub fn connect_consumer(&self) -> (ConsumerId, mpsc::Receiver<Flush>) {
        self.shared.lens.attach()
    }

    pub fn register_view(
        &self,
        consumer: ConsumerId,
        request: ViewRequest,
    ) -> Result<Vec<AttentionChange>, PipelineError> {
        self.register_views(consumer, vec![request])
    }

    /// Register several views as one batch.
    pub fn register_views(
        &self,
        consumer: ConsumerId,
        requests: Vec<ViewRequest>,
    ) -> Result<Vec<AttentionChange>, PipelineError> {
        let shared = &self.shared;
        if !shared.lens.is_attached(consumer) {
            return Err(PipelineError::UnknownConsumer(consumer));
        }
        for request in &requests {
            shared.lens.subscribe(consumer, &request.key)?;
        }
        let views = requests
            .into_iter()
            .map(|request| request.into_view(consumer))
            .collect();
        let changes = shared.tracker.register_views(views);
        shared.router.reconcile();
        Ok(changes)
    }

    pub fn unregister_view(
        &self,
        consumer: ConsumerId,
        key: &PairKey,
    ) -> Result<Vec<AttentionChange>, PipelineError> {
        self.unregister_views(consumer, std::slice::from_ref(key))
    }

    /// Remove several views as one batch.
    pub fn unregister_views(
        &self,
        consumer: ConsumerId,
        keys: &[PairKey],
    ) -> Result<Vec<AttentionChange>, PipelineError> {
        let shared = &self.shared;
        if !shared.lens.is_attached(consumer) {
            return Err(PipelineError::UnknownConsumer(consumer));
        }
        for key in keys {
            shared.lens.unsubscribe(consumer, key)?;
        }
        let changes = shared.tracker.unregister_views(consumer.into(), keys);
        shared.router.reconcile();
        Ok(changes)
    }

    pub fn set_consumer_paused(&self, consumer: ConsumerId, paused: bool) -> Result<(), PipelineError> {
        self.shared.lens.set_paused(consumer, paused)
    }

    /// Drop a consumer's views and buffer, flushing what it still holds.
    pub fn disconnect_consumer(&self, consumer: ConsumerId) -> Result<usize, PipelineError> {
        let shared = &self.shared;
        let flushed = shared.lens.detach(consumer)?;
        shared.tracker.disconnect(consumer.into());
        shared.router.reconcile();
        Ok(flushed)
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    pub fn producer(&self, sensor_id: impl Into<SensorId>) -> ProducerHandle {
        ProducerHandle {
            sensor_id: sensor_id.into(),
            shared: self.shared.clone(),
        }
    }

    /// Ingest one measurement; fails once the pipeline has been stopped.
    pub fn ingest(&self, measurement: Measurement) -> Result<usize, PipelineError> {
        self.shared.ingest(vec![measurement])
    }

    pub fn ingest_batch(&self, batch: Vec<Measurement>) -> Result<usize, PipelineError> {
        self.shared.ingest(batch)
    }

    /// Release everything held for a sensor.
    pub fn sensor_disconnected(&self, sensor: &SensorId) {
        self.shared.release_sensor(sensor);
    }

    /// Retire idle pairs now instead of waiting for the maintenance tick.
    pub fn retire_idle(&self) -> Vec<SensorId> {
        self.shared.retire_idle(crate::clock_now())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn attention_level(&self, key: &PairKey) -> AttentionLevel {
        self.shared.tracker.attention_level(key)
    }

    pub fn advisory(&self, key: &PairKey) -> BackpressureAdvisory {
        self.shared.advisories.computer().compute(key)
    }

    /// Delivery window at the configured base.
    pub fn delivery_window(&self, key: &PairKey) -> Millis {
        self.shared
            .tracker
            .delivery_window(self.shared.config.advisory.base_window(), key)
    }

    pub fn calculate_delivery_window(
        &self,
        base: Millis,
        sensor: &SensorId,
        attribute: &AttributeId,
    ) -> Millis {
        self.shared
            .tracker
            .calculate_delivery_window(base, sensor, attribute)
    }

    pub fn stats(&self) -> PipelineStats {
        let shared = &self.shared;
        PipelineStats {
            load: shared.tracker.load(),
            store: shared.store.stats(),
            lens: shared.lens.stats(),
            attention: shared.tracker.level_counts(),
            active_shards: shared.router.active_shards(),
        }
    }

    /// Follow phase synchrony of a sensor group on the raw stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn track_synchrony(&self, group: SynchronyGroup) -> watch::Receiver<SynchronyReading> {
        let shared = &self.shared;
        let computer = Arc::new(SynchronyComputer::new(group, shared.config.synchrony.clone()));
        shared.synchrony.lock().push(computer.clone());
        let rx = computer.subscribe();

        let bus = shared.bus.clone();
        spawn_supervised(
            Component::Synchrony,
            shared.events.clone(),
            shared.stop_tx.subscribe(),
            move |stop| computer.clone().run(bus.subscribe_raw(), stop),
        );
        rx
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn every background loop under supervision.
    ///
    /// Calling this more than once returns a handle without new tasks.
    pub fn start(&self) -> PipelineHandle {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            warn!("Pipeline already started");
            return PipelineHandle {
                shared: shared.clone(),
                tasks: Vec::new(),
            };
        }

        let stop = shared.stop_tx.subscribe();
        let events = shared.events.clone();
        let mut tasks = Vec::with_capacity(6);

        let sampler = shared.sampler.clone();
        tasks.push(spawn_supervised(Component::Sampler, events.clone(), stop.clone(), move |stop| {
            sampler.clone().run(stop)
        }));

        let tracker = shared.tracker.clone();
        tasks.push(spawn_supervised(
            Component::InterestWorker,
            events.clone(),
            stop.clone(),
            move |stop| run_interest_worker(tracker.clone(), stop),
        ));

        let router = shared.router.clone();
        let bus = events.clone();
        tasks.push(spawn_supervised(Component::Router, events.clone(), stop.clone(), move |stop| {
            router.clone().run(bus.subscribe(), stop)
        }));

        let advisories = shared.advisories.clone();
        let interval = shared.config.advisory.interval();
        let bus = events.clone();
        tasks.push(spawn_supervised(Component::Advisory, events.clone(), stop.clone(), move |stop| {
            advisories.clone().run(interval, bus.subscribe(), stop)
        }));

        let lens = shared.lens.clone();
        tasks.push(spawn_supervised(Component::LensSweep, events.clone(), stop.clone(), move |stop| {
            lens.clone().run_sweep(stop)
        }));

        let maintained = shared.clone();
        let bus = events.clone();
        tasks.push(spawn_supervised(Component::Maintenance, events, stop, move |stop| {
            run_maintenance(maintained.clone(), bus.subscribe(), stop)
        }));

        info!(tasks = tasks.len(), "Pipeline started");
        PipelineHandle {
            shared: shared.clone(),
            tasks,
        }
    }
}

/// Publishing side of one sensor.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    sensor_id: SensorId,
    shared: Arc<Shared>,
}

impl ProducerHandle {
    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    /// Publish one value stamped with the current time.
    pub fn publish(
        &self,
        attribute: impl Into<AttributeId>,
        payload: impl Into<Payload>,
    ) -> Result<usize, PipelineError> {
        let measurement = Measurement::new(self.sensor_id.clone(), attribute, payload);
        self.shared.ingest(vec![measurement])
    }

    /// Publish a batch; measurements of other sensors are rejected.
    ///
    /// Returns how many were accepted.
    pub fn publish_batch(&self, batch: Vec<Measurement>) -> Result<usize, PipelineError> {
        let before = batch.len();
        let accepted: Vec<Measurement> = batch
            .into_iter()
            .filter(|m| m.sensor_id == self.sensor_id)
            .collect();
        if accepted.len() < before {
            warn!(
                sensor = %self.sensor_id,
                rejected = before - accepted.len(),
                "Dropped measurements for another sensor"
            );
        }
        self.shared.ingest(accepted)
    }

    /// Advisories for one of this sensor's attributes.
    pub fn advisories(
        &self,
        attribute: impl Into<AttributeId>,
    ) -> watch::Receiver<BackpressureAdvisory> {
        let key = PairKey {
            sensor_id: self.sensor_id.clone(),
            attribute_id: attribute.into(),
        };
        self.shared.advisories.watch(&key)
    }

    /// Release everything held for this sensor.
    pub fn disconnect(self) {
        self.shared.release_sensor(&self.sensor_id);
    }
}

/// Stops the loops spawned by [`Pipeline::start`].
#[derive(Debug)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Signal every loop to stop.
    pub fn stop(&self) {
        self.shared.stop_tx.send_replace(true);
    }

    /// Signal stop and wait for the loops to finish.
    pub async fn shutdown(self) {
        self.stop();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Pipeline task ended abnormally");
            }
        }
        self.shared.router.shutdown();
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sensoflow_signals::FixedSignal;
    use sensoflow_types::LoadLevel;

    struct Rig {
        pipeline: Pipeline,
        cpu: FixedSignal,
        memory: FixedSignal,
    }

    fn rig(mut config: PipelineConfig) -> Rig {
        config.attention.idle_decay_ms = 0;
        let cpu = FixedSignal::new("cpu", 0.0);
        let memory = FixedSignal::new("memory", 0.0);
        let pipeline = Pipeline::builder()
            .config(config)
            .cpu_signal(cpu.clone())
            .memory_signal(memory.clone())
            .queue_signal(FixedSignal::new("queue", 0.0))
            .run_queue_signal(FixedSignal::new("run_queue", 0.0))
            .build()
            .unwrap();
        Rig {
            pipeline,
            cpu,
            memory,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn measurements_reach_watching_consumer() {
        let rig = rig(PipelineConfig::default());
        let pipeline = &rig.pipeline;
        let (consumer, mut flushes) = pipeline.connect_consumer();
        pipeline
            .register_view(consumer, ViewRequest::new("s1", "hr", AttentionLevel::High))
            .unwrap();

        let producer = pipeline.producer("s1");
        assert_eq!(producer.publish("hr", 72.0).unwrap(), 1);
        producer.publish("temp", 36.6).unwrap();

        let flush = tokio::time::timeout(Duration::from_secs(1), flushes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flush.len(), 1);
        assert_eq!(flush.measurements[0].attribute_id.as_str(), "hr");
        assert_eq!(pipeline.store().stats().pairs, 2);
    }

    #[tokio::test]
    async fn unknown_consumer_is_rejected() {
        let rig = rig(PipelineConfig::default());
        let err = rig
            .pipeline
            .register_view(ConsumerId(42), ViewRequest::new("s1", "hr", AttentionLevel::Low))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownConsumer(ConsumerId(42))));
    }

    #[tokio::test]
    async fn disconnect_consumer_drops_views() {
        let rig = rig(PipelineConfig::default());
        let pipeline = &rig.pipeline;
        let (consumer, _flushes) = pipeline.connect_consumer();
        let key = PairKey::new("s1", "hr");
        pipeline
            .register_view(consumer, ViewRequest::new("s1", "hr", AttentionLevel::Medium))
            .unwrap();
        assert_eq!(pipeline.router().active_shards(), vec![AttentionLevel::Medium]);

        pipeline.disconnect_consumer(consumer).unwrap();
        assert_eq!(pipeline.attention_level(&key), AttentionLevel::None);
        assert!(pipeline.router().active_shards().is_empty());
        assert!(pipeline.disconnect_consumer(consumer).is_err());
    }

    #[tokio::test]
    async fn energy_ceiling_caps_level() {
        let rig = rig(PipelineConfig::default());
        let pipeline = &rig.pipeline;
        let (consumer, _flushes) = pipeline.connect_consumer();
        pipeline
            .register_view(
                consumer,
                ViewRequest::new("s1", "hr", AttentionLevel::High).with_ceiling(AttentionLevel::Low),
            )
            .unwrap();
        assert_eq!(pipeline.attention_level(&PairKey::new("s1", "hr")), AttentionLevel::Low);
    }

    #[tokio::test]
    async fn sensor_disconnect_releases_state() {
        let rig = rig(PipelineConfig::default());
        let pipeline = &rig.pipeline;
        let mut events = pipeline.subscribe_events();
        let (consumer, _flushes) = pipeline.connect_consumer();
        pipeline
            .register_view(consumer, ViewRequest::new("s1", "hr", AttentionLevel::High))
            .unwrap();
        pipeline.producer("s1").publish("hr", 60.0).unwrap();

        pipeline.sensor_disconnected(&SensorId::new("s1"));
        assert_eq!(pipeline.store().stats().pairs, 0);
        assert_eq!(pipeline.attention_level(&PairKey::new("s1", "hr")), AttentionLevel::None);
        assert!(pipeline.router().active_shards().is_empty());

        let mut retired = false;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::SensorRetired { sensor_id } = event {
                retired = sensor_id.as_str() == "s1";
            }
        }
        assert!(retired);
    }

    #[tokio::test]
    async fn producer_batch_rejects_foreign_sensors() {
        let rig = rig(PipelineConfig::default());
        let producer = rig.pipeline.producer("s1");
        let accepted = producer.publish_batch(vec![
            Measurement::with_timestamp("s1", "hr", 60.0, 1),
            Measurement::with_timestamp("s2", "hr", 61.0, 1),
        ]);
        assert_eq!(accepted.unwrap(), 1);
    }

    #[tokio::test]
    async fn novelty_is_announced() {
        let rig = rig(PipelineConfig::default());
        let pipeline = &rig.pipeline;
        let mut events = pipeline.subscribe_events();

        let batch = (0..30)
            .map(|i| Measurement::with_timestamp("s1", "hr", 60.0 + (i % 3) as f64, i))
            .collect();
        pipeline.ingest_batch(batch).unwrap();
        pipeline.ingest(Measurement::with_timestamp("s1", "hr", 500.0, 31)).unwrap();

        let mut novel = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PipelineEvent::Novelty(_)) {
                novel += 1;
            }
        }
        assert_eq!(novel, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn started_pipeline_follows_load() {
        let mut config = PipelineConfig::default();
        config.sampler.interval_ms = 100;
        let rig = rig(config);
        let pipeline = &rig.pipeline;
        let handle = pipeline.start();

        let key = PairKey::new("s1", "hr");
        let producer = pipeline.producer("s1");
        let mut advice = producer.advisories("hr");
        assert!(!advice.borrow_and_update().paused);

        rig.cpu.set(1.0);
        rig.memory.set(1.0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(pipeline.load().level, LoadLevel::Elevated);
        assert!(pipeline.load().memory_protection);
        assert!(pipeline.advisory(&key).paused);

        advice.changed().await.unwrap();
        assert!(advice.borrow().paused);

        handle.shutdown().await;
        assert!(matches!(producer.publish("hr", 1.0), Err(PipelineError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_consumer_loses_its_views() {
        let rig = rig(PipelineConfig::default());
        let pipeline = &rig.pipeline;
        let handle = pipeline.start();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let key = PairKey::new("s1", "hr");
        let (consumer, flushes) = pipeline.connect_consumer();
        pipeline
            .register_view(consumer, ViewRequest::new("s1", "hr", AttentionLevel::High))
            .unwrap();
        assert_eq!(pipeline.router().active_shards(), vec![AttentionLevel::High]);

        drop(flushes);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pipeline.attention_level(&key), AttentionLevel::None);
        assert!(pipeline.router().active_shards().is_empty());
        assert!(pipeline.disconnect_consumer(consumer).is_err());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn maintenance_reaps_views_without_a_buffer() {
        let rig = rig(PipelineConfig::default());
        let pipeline = &rig.pipeline;
        let shared = &pipeline.shared;
        let key = PairKey::new("s1", "hr");
        shared.tracker.register_view(AttentionView::new(
            ConsumerId(77).into(),
            key.clone(),
            AttentionLevel::Medium,
        ));
        let (live, _flushes) = pipeline.connect_consumer();
        pipeline
            .register_view(live, ViewRequest::new("s2", "hr", AttentionLevel::Low))
            .unwrap();

        assert_eq!(shared.reap_vanished_consumers(), 1);
        assert_eq!(pipeline.attention_level(&key), AttentionLevel::None);
        assert_eq!(
            pipeline.attention_level(&PairKey::new("s2", "hr")),
            AttentionLevel::Low
        );
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_retires_idle_sensors() {
        let mut config = PipelineConfig::default();
        config.maintenance.interval_ms = 1_000;
        config.maintenance.sensor_idle_timeout_ms = 5_000;
        let rig = rig(config);
        let pipeline = &rig.pipeline;
        let handle = pipeline.start();

        pipeline.producer("idle").publish("temp", 20.0).unwrap();
        let (consumer, _flushes) = pipeline.connect_consumer();
        pipeline
            .register_view(consumer, ViewRequest::new("watched", "temp", AttentionLevel::Low))
            .unwrap();
        pipeline.producer("watched").publish("temp", 20.0).unwrap();

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        let store = pipeline.store();
        assert!(!store.has_sensor(&SensorId::new("idle")));
        assert!(store.has_sensor(&SensorId::new("watched")));

        handle.shutdown().await;
    }
}

//! End-to-end behaviour of the assembled pipeline.

use std::sync::Arc;
use std::time::Duration;

use sensoflow::config::PipelineConfig;
use sensoflow::controllers::ControllerSet;
use sensoflow::events::EventBus;
use sensoflow::interest::{AttentionView, InterestTracker};
use sensoflow::sampler::LoadSample;
use sensoflow::store::TieredStore;
use sensoflow::{Pipeline, PipelineEvent, ViewRequest};
use sensoflow_signals::FixedSignal;
use sensoflow_types::{
    AttentionLevel, AttributeId, ConnectionId, LoadLevel, Measurement, Millis, PairKey, SensorId,
};
use tokio::sync::watch;

struct Rig {
    pipeline: Pipeline,
    cpu: FixedSignal,
    queue: FixedSignal,
    memory: FixedSignal,
    run_queue: FixedSignal,
}

impl Rig {
    fn new(config: PipelineConfig) -> Self {
        let cpu = FixedSignal::new("cpu", 0.0);
        let queue = FixedSignal::new("queue", 0.0);
        let memory = FixedSignal::new("memory", 0.0);
        let run_queue = FixedSignal::new("run_queue", 0.0);
        let pipeline = Pipeline::builder()
            .config(config)
            .cpu_signal(cpu.clone())
            .queue_signal(queue.clone())
            .memory_signal(memory.clone())
            .run_queue_signal(run_queue.clone())
            .build()
            .expect("valid config");
        Self {
            pipeline,
            cpu,
            queue,
            memory,
            run_queue,
        }
    }

    fn no_decay() -> Self {
        let mut config = PipelineConfig::default();
        config.attention.idle_decay_ms = 0;
        Self::new(config)
    }

    /// Set every signal to `value` and take one sample.
    fn load_all(&self, value: f64) -> LoadLevel {
        self.cpu.set(value);
        self.queue.set(value);
        self.memory.set(value);
        self.run_queue.set(value);
        self.pipeline.sampler().sample().level
    }
}

fn tracker(config: &PipelineConfig) -> (watch::Sender<LoadSample>, InterestTracker) {
    let (tx, rx) = watch::channel(LoadSample::default());
    let tracker = InterestTracker::new(
        config,
        ControllerSet::new(config.controllers.factor_min, config.controllers.factor_max),
        rx,
        EventBus::default(),
    );
    (tx, tracker)
}

#[tokio::test]
async fn high_attention_at_normal_load_gets_min_window() {
    let rig = Rig::no_decay();
    let pipeline = &rig.pipeline;
    let (consumer, _flushes) = pipeline.connect_consumer();
    pipeline
        .register_view(consumer, ViewRequest::new("s1", "temp", AttentionLevel::High))
        .unwrap();

    let window = pipeline.calculate_delivery_window(
        Millis(100),
        &SensorId::new("s1"),
        &AttributeId::new("temp"),
    );
    assert_eq!(window, Millis(20));
    assert_eq!(window, pipeline.config().attention.high.min_window());
}

#[tokio::test]
async fn unwatched_pair_is_paused_at_critical_load() {
    let rig = Rig::no_decay();
    assert_eq!(rig.load_all(1.0), LoadLevel::Critical);

    let advisory = rig.pipeline.advisory(&PairKey::new("s1", "temp"));
    assert_eq!(advisory.attention_level, AttentionLevel::None);
    assert_eq!(advisory.system_load, LoadLevel::Critical);
    assert!(advisory.paused);
}

#[tokio::test]
async fn bulk_register_then_bulk_unregister_restores_baseline() {
    let rig = Rig::no_decay();
    let pipeline = &rig.pipeline;
    let (consumer, _flushes) = pipeline.connect_consumer();

    let requests: Vec<ViewRequest> = (0..50)
        .map(|i| ViewRequest::new(format!("s{i}"), "temp", AttentionLevel::Medium))
        .collect();
    let keys: Vec<PairKey> = requests.iter().map(|r| r.key.clone()).collect();

    let changes = pipeline.register_views(consumer, requests).unwrap();
    assert_eq!(changes.len(), 50);
    assert_eq!(pipeline.stats().attention, [0, 0, 50, 0]);

    let changes = pipeline.unregister_views(consumer, &keys).unwrap();
    assert_eq!(changes.len(), 50);
    assert_eq!(pipeline.stats().attention, [0, 0, 0, 0]);
    assert_eq!(pipeline.tracker().table().pair_count(), 0);
    for key in &keys {
        assert_eq!(pipeline.attention_level(key), AttentionLevel::None);
    }
    assert!(pipeline.router().active_shards().is_empty());
}

#[test]
fn aggregate_level_is_max_of_views() {
    let config = PipelineConfig::default();
    let (_tx, tracker) = tracker(&config);
    let key = PairKey::new("s1", "hr");

    tracker.register_view(AttentionView::new(ConnectionId(1), key.clone(), AttentionLevel::Low));
    tracker.register_view(AttentionView::new(ConnectionId(2), key.clone(), AttentionLevel::High));
    tracker.register_view(AttentionView::new(ConnectionId(3), key.clone(), AttentionLevel::Medium));
    assert_eq!(tracker.attention_level(&key), AttentionLevel::High);

    tracker.unregister_view(ConnectionId(2), &key);
    assert_eq!(tracker.attention_level(&key), AttentionLevel::Medium);
}

#[tokio::test(start_paused = true)]
async fn last_view_lingers_for_idle_period() {
    let mut config = PipelineConfig::default();
    config.attention.idle_decay_ms = 10_000;
    let (_tx, tracker) = tracker(&config);
    let key = PairKey::new("s1", "hr");

    tracker.register_view(AttentionView::new(ConnectionId(1), key.clone(), AttentionLevel::High));
    tracker.unregister_view(ConnectionId(1), &key);

    tokio::time::sleep(Duration::from_millis(9_000)).await;
    assert_eq!(tracker.attention_level(&key), AttentionLevel::High);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(tracker.attention_level(&key), AttentionLevel::None);
}

#[test]
fn bulk_registration_matches_sequential() {
    let config = PipelineConfig::default();
    let (_a, bulk) = tracker(&config);
    let (_b, sequential) = tracker(&config);

    let views: Vec<AttentionView> = (0..30)
        .map(|i| {
            AttentionView::new(
                ConnectionId(i % 4),
                PairKey::new(format!("s{}", i % 7), "temp"),
                AttentionLevel::from_index((i % 4) as usize),
            )
        })
        .collect();

    bulk.register_views(views.clone());
    for view in views {
        sequential.register_view(view);
    }

    assert_eq!(bulk.snapshot(), sequential.snapshot());
    assert_eq!(bulk.level_counts(), sequential.level_counts());
}

#[test]
fn window_always_within_level_bounds() {
    let config = PipelineConfig::default();
    let (tx, tracker) = tracker(&config);
    let key = PairKey::new("s1", "temp");

    for load in LoadLevel::ALL {
        tx.send_replace(LoadSample::at(load));
        for level in AttentionLevel::ALL {
            let profile = config.attention.profile(level);
            for base in [0u64, 1, 20, 100, 500, 5_000, 60_000, u32::MAX as u64] {
                let window = tracker.window_for(
                    Millis(base),
                    &key,
                    level,
                    load,
                    std::time::Instant::now(),
                );
                assert!(window >= profile.min_window(), "{level} {load} {base}");
                assert!(window <= profile.max_window(), "{level} {load} {base}");
            }
        }
    }
}

#[tokio::test]
async fn pause_rules_follow_attention_and_load() {
    let rig = Rig::no_decay();
    let pipeline = &rig.pipeline;
    let (consumer, _flushes) = pipeline.connect_consumer();
    pipeline
        .register_views(
            consumer,
            vec![
                ViewRequest::new("s1", "high", AttentionLevel::High),
                ViewRequest::new("s1", "low", AttentionLevel::Low),
            ],
        )
        .unwrap();
    let high = PairKey::new("s1", "high");
    let low = PairKey::new("s1", "low");

    // critical without memory pressure
    rig.cpu.set(1.0);
    rig.queue.set(1.0);
    rig.run_queue.set(1.0);
    rig.memory.set(0.5);
    assert_eq!(pipeline.sampler().sample().level, LoadLevel::Critical);
    assert!(pipeline.advisory(&low).paused);
    assert!(!pipeline.advisory(&high).paused);

    // memory protection at normal load
    rig.cpu.set(0.0);
    rig.queue.set(0.0);
    rig.run_queue.set(0.0);
    rig.memory.set(0.9);
    let sample = pipeline.sampler().sample();
    assert_eq!(sample.level, LoadLevel::Normal);
    assert!(sample.memory_protection);
    assert!(pipeline.advisory(&low).paused);
    assert!(!pipeline.advisory(&high).paused);

    // elevated only: nobody pauses
    assert_eq!(rig.load_all(0.6), LoadLevel::Elevated);
    assert!(!pipeline.advisory(&low).paused);
}

#[test]
fn store_respects_load_scaled_limits() {
    let config = PipelineConfig::default();
    let (tx, rx) = watch::channel(LoadSample::at(LoadLevel::High));
    let store = TieredStore::new(config.store.clone(), rx);
    let key = PairKey::new("s1", "ecg");

    let capacity = store.effective_capacity("ecg");
    assert_eq!(capacity.hot, 30); // 150 × 0.2

    for ts in 0..59 {
        store.insert(Arc::new(Measurement::with_timestamp("s1", "ecg", ts as f64, ts)));
    }
    // below twice the limit nothing is evicted, but reads are capped
    assert_eq!(store.stats().evicted, 0);
    assert!(store.hot(&key).len() <= capacity.hot);

    store.insert(Arc::new(Measurement::with_timestamp("s1", "ecg", 59.0, 59)));
    assert!(store.hot(&key).len() <= capacity.hot);
    assert_eq!(store.latest(&key).map(|m| m.timestamp), Some(59));

    tx.send_replace(LoadSample::at(LoadLevel::Normal));
    assert_eq!(store.effective_capacity("ecg").hot, 150);
}

#[tokio::test]
async fn stable_series_is_never_novel_but_outlier_is_once() {
    let rig = Rig::no_decay();
    let pipeline = &rig.pipeline;
    let mut events = pipeline.subscribe_events();

    for i in 0..200 {
        let value = 20.0 + (i % 5) as f64 * 0.1;
        pipeline
            .ingest(Measurement::with_timestamp("s1", "temp", value, i))
            .unwrap();
    }
    let novel = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PipelineEvent::Novelty(_)))
        .count();
    assert_eq!(novel, 0);

    pipeline
        .ingest_batch(vec![
            Measurement::with_timestamp("s1", "temp", 90.0, 200),
            Measurement::with_timestamp("s1", "temp", 95.0, 201),
        ])
        .unwrap();
    let novel: Vec<PipelineEvent> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, PipelineEvent::Novelty(_)))
        .collect();
    assert_eq!(novel.len(), 1);
    match &novel[0] {
        PipelineEvent::Novelty(event) => {
            assert_eq!(event.key, PairKey::new("s1", "temp"));
            assert_eq!(event.value, 95.0);
            assert!(event.z_score > 3.0);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn paused_consumer_receives_remaining_data_on_disconnect() {
    let rig = Rig::no_decay();
    let pipeline = &rig.pipeline;
    let (consumer, mut flushes) = pipeline.connect_consumer();
    pipeline
        .register_view(consumer, ViewRequest::new("s1", "hr", AttentionLevel::High))
        .unwrap();
    pipeline.set_consumer_paused(consumer, true).unwrap();

    let producer = pipeline.producer("s1");
    for v in [60.0, 61.0, 62.0] {
        producer.publish("hr", v).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(flushes.try_recv().is_err());

    assert_eq!(pipeline.disconnect_consumer(consumer).unwrap(), 3);
    let flush = flushes.recv().await.unwrap();
    let values: Vec<f64> = flush.measurements.iter().flat_map(|m| m.values().to_vec()).collect();
    assert_eq!(values, vec![60.0, 61.0, 62.0]);
}

#[tokio::test(start_paused = true)]
async fn synchrony_tracks_in_phase_group() {
    let rig = Rig::no_decay();
    let pipeline = &rig.pipeline;
    let readings = pipeline.track_synchrony(sensoflow::SynchronyGroup::new(["a", "b"], "resp"));
    tokio::task::yield_now().await;

    for i in 0..40 {
        let v = (i as f64 * 0.5).sin();
        pipeline
            .ingest_batch(vec![
                Measurement::with_timestamp("a", "resp", v, i),
                Measurement::with_timestamp("b", "resp", v, i),
            ])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let reading = *readings.borrow();
    assert_eq!(reading.sensors, 2);
    assert!(reading.smoothed > 0.8, "smoothed = {}", reading.smoothed);
}

//! Example: A simulated monitoring room
//!
//! Four wearables stream heart rate, respiration and ECG bursts into a
//! pipeline while two dashboards watch them at different attention levels.
//! Halfway through, the synthetic CPU signal spikes and the pipeline backs
//! off: windows stretch, low-interest pairs pause and dashboards drop to
//! coarser tiers.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=sensoflow=debug cargo run --example simulated_room
//! ```

use std::time::Duration;

use anyhow::Result;
use sensoflow::{Pipeline, PipelineConfig, PipelineEvent, ViewRequest};
use sensoflow_signals::FixedSignal;
use sensoflow_types::{AttentionLevel, PairKey};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SENSORS: [&str; 4] = ["wrist-1", "wrist-2", "chest-1", "chest-2"];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sensoflow=info")),
        )
        .init();

    let mut config = PipelineConfig::load(None)?;
    config.sampler.interval_ms = 250;
    config.advisory.interval_ms = 250;

    // Synthetic CPU load so the demo behaves the same on any machine
    let cpu = FixedSignal::new("cpu", 0.1);
    let pipeline = Pipeline::builder()
        .config(config)
        .cpu_signal(cpu.clone())
        .build()?;
    let handle = pipeline.start();

    let (nurse, mut nurse_flushes) = pipeline.connect_consumer();
    let (wall, mut wall_flushes) = pipeline.connect_consumer();

    pipeline.register_views(
        nurse,
        vec![
            ViewRequest::new("chest-1", "ecg", AttentionLevel::High),
            ViewRequest::new("chest-1", "hr", AttentionLevel::High),
            ViewRequest::new("wrist-1", "hr", AttentionLevel::Medium),
        ],
    )?;
    pipeline.register_views(
        wall,
        SENSORS
            .iter()
            .map(|sensor| ViewRequest::new(*sensor, "hr", AttentionLevel::Low))
            .collect(),
    )?;

    tokio::spawn(async move {
        while let Some(flush) = nurse_flushes.recv().await {
            info!(seq = flush.sequence, tier = ?flush.tier, n = flush.len(), "nurse station flush");
        }
    });
    tokio::spawn(async move {
        while let Some(flush) = wall_flushes.recv().await {
            info!(seq = flush.sequence, tier = ?flush.tier, n = flush.len(), "wall display flush");
        }
    });

    let mut events = pipeline.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::LoadChanged { previous, current, blend } => {
                    info!(%previous, %current, blend, "load changed");
                }
                PipelineEvent::Novelty(novelty) => {
                    info!(pair = %novelty.key, z = novelty.z_score, "novel reading");
                }
                _ => {}
            }
        }
    });

    let producers: Vec<_> = SENSORS.iter().map(|s| pipeline.producer(*s)).collect();
    let mut ticker = tokio::time::interval(Duration::from_millis(50));

    for step in 0..200u32 {
        ticker.tick().await;
        let t = step as f64 * 0.05;

        if step == 80 {
            info!("CPU spike");
            cpu.set(1.0);
        }
        if step == 160 {
            info!("CPU back to idle");
            cpu.set(0.1);
        }

        for (i, producer) in producers.iter().enumerate() {
            let phase = i as f64 * 0.3;
            let mut hr = 70.0 + 5.0 * (t + phase).sin();
            if step == 120 && i == 0 {
                hr = 160.0;
            }
            producer.publish("hr", hr)?;
            producer.publish("resp", (t * 0.25 + phase).sin())?;
            if producer.sensor_id().as_str().starts_with("chest") {
                let burst: Vec<f64> = (0..10).map(|k| ((t + k as f64 * 0.005) * 7.0).sin()).collect();
                producer.publish("ecg", burst)?;
            }
        }

        if step % 40 == 0 {
            let key = PairKey::new("wrist-2", "hr");
            let advisory = pipeline.advisory(&key);
            let stats = pipeline.stats();
            info!(
                load = %stats.load.level,
                window = pipeline.delivery_window(&key).as_millis(),
                paused = advisory.paused,
                batch_window = advisory.effective_batch_window(),
                buffered = stats.lens.buffered,
                "room status"
            );
        }
    }

    let flushed = pipeline.disconnect_consumer(nurse)? + pipeline.disconnect_consumer(wall)?;
    info!(flushed, "dashboards disconnected");
    handle.shutdown().await;
    Ok(())
}

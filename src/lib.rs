//! # sensoflow
//!
//! Attention-driven backpressure and routing for real-time sensor telemetry.
//!
//! Sensors publish `(sensor, attribute)` measurements; consumers register
//! *views* on the pairs they display. The pipeline uses the combination of
//! how closely each pair is watched and how loaded the host is to decide
//! how fast each pair's data flows, both towards consumers and (through
//! advisories) back at the producers.
//!
//! ## Architecture
//!
//! ```text
//!  producers ──publish──▶ ShardedBus ──shard──▶ Router ──write──▶ ConsumerLens ──▶ Flush
//!      ▲                      │ raw                                   ▲
//!      │                      ▼                                       │ tier floor
//!  advisories           SynchronyComputer                             │
//!      ▲                                                              │
//!  InterestTracker ◀──level── LoadSampler ─────────────────────────────┘
//!      ▲
//!  Controllers (factor)
//! ```
//!
//! - **[`sampler`]**: blends CPU, queue, memory and run-queue pressure into a [`LoadLevel`]
//! - **[`interest`]**: the view table, aggregate attention and delivery windows
//! - **[`store`]**: per-pair hot/warm history with load-scaled limits
//! - **[`router`]**: attention shards and demand-driven subscriptions
//! - **[`lens`]**: per-consumer buffers flushed on adaptive quality tiers
//! - **[`controllers`]**: novelty, arbitration, homeostasis, circadian and predictive factors
//! - **[`advisory`]**: batch window, batch size and pause advice for producers
//! - **[`synchrony`]**: phase synchrony across sensor groups
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensoflow::{Pipeline, PipelineConfig, ViewRequest};
//! use sensoflow_types::AttentionLevel;
//!
//! # async fn demo() -> Result<(), sensoflow::PipelineError> {
//! let pipeline = Pipeline::new(PipelineConfig::load(None)?)?;
//! let handle = pipeline.start();
//!
//! let (consumer, mut flushes) = pipeline.connect_consumer();
//! pipeline.register_view(consumer, ViewRequest::new("wrist-1", "hr", AttentionLevel::High))?;
//!
//! let sensor = pipeline.producer("wrist-1");
//! sensor.publish("hr", 72.0)?;
//!
//! while let Some(flush) = flushes.recv().await {
//!     println!("{}", flush.to_json().unwrap_or_default());
//! }
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Producer Advisories
//!
//! Producers watch a per-pair advisory and back off when asked to:
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use sensoflow::{Pipeline, PipelineConfig};
//!
//! let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
//! let sensor = pipeline.producer("wrist-1");
//! let advisories = sensor.advisories("hr");
//!
//! let advice = advisories.borrow().clone();
//! if !advice.should_pause() {
//!     sensor.publish("hr", 72.0).unwrap();
//! }
//! assert_eq!(advice.recommended_batch_size, 20);
//! # });
//! ```
//!
//! ## Configuration
//!
//! [`PipelineConfig`] reads an optional TOML file and `SENSOFLOW__*`
//! environment variables (`SENSOFLOW__SAMPLER__INTERVAL_MS=500`).
//!
//! [`LoadLevel`]: sensoflow_types::LoadLevel

pub mod advisory;
pub mod config;
pub mod controllers;
pub mod error;
pub mod events;
pub mod interest;
pub mod lens;
pub mod pipeline;
pub mod router;
pub mod sampler;
pub mod store;
pub mod supervisor;
pub mod synchrony;

pub use advisory::{AdvisoryComputer, AdvisoryPublisher};
pub use config::PipelineConfig;
pub use controllers::{Controller, ControllerSet};
pub use error::{ControllerError, PipelineError};
pub use events::{AttentionChange, EventBus, NoveltyEvent, PipelineEvent};
pub use interest::{AttentionView, InterestTracker};
pub use lens::{ConsumerLens, Flush, QualityTier};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandle, PipelineStats, ProducerHandle, ViewRequest};
pub use sampler::{LoadSample, LoadSampler};
pub use store::TieredStore;
pub use synchrony::{SynchronyGroup, SynchronyReading};

/// Current time on tokio's clock, so paused-time tests see timers and
/// timestamps move together.
pub(crate) fn clock_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

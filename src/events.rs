//! Pipeline-wide event stream.
//!
//! Components publish state transitions on a broadcast channel so that
//! others (the router, the advisory publisher, external observers) can
//! react without polling.

use sensoflow_types::{AttentionLevel, ConsumerId, LoadLevel, PairKey, SensorId};
use tokio::sync::broadcast;

/// A change in a pair's aggregate attention level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionChange {
    pub key: PairKey,
    pub previous: AttentionLevel,
    pub current: AttentionLevel,
}

/// A statistically unusual measurement batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NoveltyEvent {
    pub key: PairKey,
    pub z_score: f64,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Background components that run under supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Sampler,
    InterestWorker,
    Router,
    Advisory,
    LensSweep,
    Maintenance,
    Synchrony,
}

impl Component {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Component::Sampler => "sampler",
            Component::InterestWorker => "interest-worker",
            Component::Router => "router",
            Component::Advisory => "advisory",
            Component::LensSweep => "lens-sweep",
            Component::Maintenance => "maintenance",
            Component::Synchrony => "synchrony",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something other components may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// The classified load level changed.
    LoadChanged {
        previous: LoadLevel,
        current: LoadLevel,
        blend: f64,
    },
    /// Memory protection switched on or off.
    MemoryProtection { active: bool },
    /// One or more pairs changed aggregate attention (one batch per mutation).
    AttentionChanged(Vec<AttentionChange>),
    /// A component crashed and is being restarted.
    StateRebuilding { component: Component },
    /// A pair produced a novel batch.
    Novelty(NoveltyEvent),
    /// A sensor was disconnected or retired and its state released.
    SensorRetired { sensor_id: SensorId },
    /// A consumer's channel closed without an explicit disconnect.
    ConsumerGone { consumer: ConsumerId },
}

/// Cloneable publisher for [`PipelineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish an attention batch if it is non-empty.
    pub fn emit_attention(&self, changes: &[AttentionChange]) {
        if !changes.is_empty() {
            self.emit(PipelineEvent::AttentionChanged(changes.to_vec()));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

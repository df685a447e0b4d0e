//! Attention-sharded routing.
//!
//! Producers publish into a [`ShardedBus`]: every measurement goes to the
//! raw channel and, unless its pair has no attention, to the broadcast shard
//! of its current level. The [`Router`] keeps one forwarding task per shard
//! that currently has demand and writes what it receives straight into the
//! [`ConsumerLens`]. When the last viewed pair leaves a level the shard's
//! forwarder is aborted and the shard goes quiet.

use std::sync::Arc;

use parking_lot::Mutex;
use sensoflow_types::{AttentionLevel, Measurement};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::events::PipelineEvent;
use crate::interest::InterestTracker;
use crate::lens::ConsumerLens;

/// Shard slot for a level; `None` has no shard.
fn shard_index(level: AttentionLevel) -> Option<usize> {
    match level {
        AttentionLevel::None => None,
        other => Some(other.index() - 1),
    }
}

/// One broadcast channel per attention shard plus a raw channel.
#[derive(Debug)]
pub struct ShardedBus {
    shards: [broadcast::Sender<Arc<Measurement>>; 3],
    raw: broadcast::Sender<Arc<Measurement>>,
}

impl ShardedBus {
    pub fn new(config: &RouterConfig) -> Self {
        let shard = || broadcast::channel(config.shard_capacity.max(1)).0;
        Self {
            shards: [shard(), shard(), shard()],
            raw: broadcast::channel(config.raw_capacity.max(1)).0,
        }
    }

    /// Publish to the raw channel and the shard of `level`.
    ///
    /// Returns `true` if a shard subscriber received it.
    pub fn publish(&self, measurement: Arc<Measurement>, level: AttentionLevel) -> bool {
        let routed = shard_index(level)
            .map(|i| self.shards[i].send(measurement.clone()).is_ok())
            .unwrap_or(false);
        let _ = self.raw.send(measurement);
        routed
    }

    pub fn subscribe_shard(
        &self,
        level: AttentionLevel,
    ) -> Option<broadcast::Receiver<Arc<Measurement>>> {
        shard_index(level).map(|i| self.shards[i].subscribe())
    }

    /// Every published measurement regardless of attention.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Arc<Measurement>> {
        self.raw.subscribe()
    }

    pub fn shard_subscribers(&self, level: AttentionLevel) -> usize {
        shard_index(level).map_or(0, |i| self.shards[i].receiver_count())
    }
}

/// Keeps shard subscriptions in line with attention demand.
#[derive(Debug)]
pub struct Router {
    bus: Arc<ShardedBus>,
    lens: Arc<ConsumerLens>,
    tracker: Arc<InterestTracker>,
    forwarders: Mutex<[Option<JoinHandle<()>>; 3]>,
}

impl Router {
    pub fn new(bus: Arc<ShardedBus>, lens: Arc<ConsumerLens>, tracker: Arc<InterestTracker>) -> Self {
        Self {
            bus,
            lens,
            tracker,
            forwarders: Mutex::new([None, None, None]),
        }
    }

    pub fn bus(&self) -> &Arc<ShardedBus> {
        &self.bus
    }

    /// Subscribe to shards with demand and drop the rest.
    ///
    /// Subscriptions are taken synchronously, so anything published after
    /// this returns reaches the lens.
    pub fn reconcile(&self) {
        let counts = self.tracker.level_counts();
        let mut forwarders = self.forwarders.lock();

        for level in AttentionLevel::SHARDED {
            let Some(slot) = shard_index(level) else {
                continue;
            };
            let demand = counts[level.index()] > 0;
            let running = forwarders[slot]
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());

            if demand && !running {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(shard = %level, "No runtime to start shard forwarder");
                    continue;
                };
                let Some(rx) = self.bus.subscribe_shard(level) else {
                    continue;
                };
                forwarders[slot] = Some(runtime.spawn(forward(level, rx, self.lens.clone())));
                info!(shard = %level, pairs = counts[level.index()], "Subscribed to shard");
            } else if !demand {
                if let Some(handle) = forwarders[slot].take() {
                    handle.abort();
                    info!(shard = %level, "Unsubscribed from shard");
                }
            }
        }
    }

    pub fn is_subscribed(&self, level: AttentionLevel) -> bool {
        shard_index(level).is_some_and(|slot| {
            self.forwarders.lock()[slot]
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
        })
    }

    /// Shards that currently have a forwarder, highest first.
    pub fn active_shards(&self) -> Vec<AttentionLevel> {
        AttentionLevel::SHARDED
            .into_iter()
            .filter(|level| self.is_subscribed(*level))
            .collect()
    }

    /// Abort every forwarder.
    pub fn shutdown(&self) {
        for handle in self.forwarders.lock().iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }

    /// Reconcile on attention changes until `stop` is set.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PipelineEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        self.reconcile();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PipelineEvent::AttentionChanged(_))
                    | Ok(PipelineEvent::StateRebuilding { .. })
                    | Ok(PipelineEvent::SensorRetired { .. }) => self.reconcile(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Router missed pipeline events, reconciling");
                        self.reconcile();
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

        self.shutdown();
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn forward(
    level: AttentionLevel,
    mut rx: broadcast::Receiver<Arc<Measurement>>,
    lens: Arc<ConsumerLens>,
) {
    loop {
        match rx.recv().await {
            Ok(measurement) => {
                lens.write(&measurement);
            }
            Err(RecvError::Lagged(dropped)) => {
                warn!(shard = %level, dropped, "Shard forwarder lagged");
            }
            Err(RecvError::Closed) => {
                debug!(shard = %level, "Shard closed");
                break;
            }
        }
    }
}

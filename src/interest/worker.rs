//! Background worker for the interest tracker.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use super::InterestTracker;

/// Sweep lingering levels and tick the controllers until `stop` is set.
///
/// All state lives in the tracker, so the worker can be restarted at any
/// point without losing views.
pub async fn run_interest_worker(tracker: Arc<InterestTracker>, mut stop: watch::Receiver<bool>) {
    let mut decay = tokio::time::interval(tracker.config().decay_sweep_interval());
    decay.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut controllers = tokio::time::interval(tracker.controller_tick_interval());
    controllers.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = decay.tick() => {
                let changes = tracker.decay_expired(crate::clock_now());
                if !changes.is_empty() {
                    trace!(expired = changes.len(), "Lingering attention expired");
                }
            }
            _ = controllers.tick() => {
                tracker.tick_controllers(crate::clock_now(), sensoflow_types::current_timestamp_ms());
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sensoflow_types::{AttentionLevel, ConnectionId, PairKey};

    use crate::config::PipelineConfig;
    use crate::controllers::ControllerSet;
    use crate::events::{EventBus, PipelineEvent};
    use crate::interest::AttentionView;
    use crate::sampler::LoadSample;

    #[tokio::test(start_paused = true)]
    async fn worker_expires_lingering_levels() {
        let mut config = PipelineConfig::default();
        config.attention.idle_decay_ms = 2_000;
        config.attention.decay_sweep_interval_ms = 500;

        let (_load_tx, load_rx) = watch::channel(LoadSample::default());
        let events = EventBus::default();
        let tracker = Arc::new(InterestTracker::new(
            &config,
            ControllerSet::new(0.5, 5.0),
            load_rx,
            events.clone(),
        ));
        let key = PairKey::new("s1", "temp");
        tracker.register_view(AttentionView::new(ConnectionId(1), key.clone(), AttentionLevel::High));
        tracker.unregister_view(ConnectionId(1), &key);

        let mut rx = events.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_interest_worker(tracker.clone(), stop_rx));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(tracker.attention_level(&key), AttentionLevel::High);

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert_eq!(tracker.attention_level(&key), AttentionLevel::None);
        match rx.try_recv().unwrap() {
            PipelineEvent::AttentionChanged(changes) => {
                assert_eq!(changes[0].previous, AttentionLevel::High);
                assert_eq!(changes[0].current, AttentionLevel::None);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(tracker.table().pair_count(), 0);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}

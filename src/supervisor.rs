//! Restart-on-panic supervision for background workers.
//!
//! Workers keep their long-lived state in shared structures (tables, maps,
//! channels) and only hold control flow themselves, so a crashed worker can
//! be restarted against the same state. Each restart is announced with
//! [`PipelineEvent::StateRebuilding`] so dependents can re-register.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::events::{Component, EventBus, PipelineEvent};

/// Pause between a crash and the restart.
const RESTART_DELAY: Duration = Duration::from_millis(100);

/// Run `make(stop)` in a task, restarting it whenever it panics.
///
/// The worker is expected to return once `stop` flips to `true`; a clean
/// return ends supervision.
pub fn spawn_supervised<F, Fut>(
    component: Component,
    events: EventBus,
    stop: watch::Receiver<bool>,
    make: F,
) -> JoinHandle<()>
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts: u64 = 0;
        loop {
            let worker = tokio::spawn(make(stop.clone()));
            match worker.await {
                Ok(()) => {
                    debug!(component = %component, "Worker stopped");
                    break;
                }
                Err(e) if e.is_panic() => {
                    if *stop.borrow() {
                        break;
                    }
                    restarts += 1;
                    error!(component = %component, restarts, "Worker panicked, restarting");
                    events.emit(PipelineEvent::StateRebuilding { component });
                    tokio::time::sleep(RESTART_DELAY).await;
                }
                Err(_) => break,
            }
        }
    })
}

//! Live availability snapshots for one platform and date.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::Engine;
use crate::model::{AvailableBlock, Platform};
use crate::notify::Channel;

/// Handle to a running availability watch. Dropping it stops the task.
pub struct AvailabilityWatch {
    pub rx: watch::Receiver<Vec<AvailableBlock>>,
    handle: JoinHandle<()>,
    token: CancellationToken,
}

impl AvailabilityWatch {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for AvailabilityWatch {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Time left until the next multiple of `period` since the epoch.
pub fn until_next_tick(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = (period.as_millis() as i64).max(1);
    let into = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - into) as u64)
}

/// Publish the platform's open blocks for `date`, recomputed after every
/// change on that platform and on each `reconcile` boundary.
pub async fn watch_availability(
    engine: Arc<Engine>,
    date: NaiveDate,
    platform: Platform,
    reconcile: Duration,
    cancel: CancellationToken,
) -> AvailabilityWatch {
    // Subscribe before the first snapshot so no change falls in between.
    let mut events = engine.notify.subscribe(Channel::Platform(platform));
    let initial = engine.available_blocks(date, platform).await;
    let (tx, rx) = watch::channel(initial);
    let token = cancel.child_token();
    let task_token = token.clone();

    let handle = tokio::spawn(async move {
        metrics::gauge!(crate::observability::WATCHES_ACTIVE).increment(1.0);
        loop {
            let wait = until_next_tick(engine.now(), reconcile);
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = tx.closed() => break,
                recv = events.recv() => match recv {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        // Coalesce a burst into one recompute.
                        loop {
                            match events.try_recv() {
                                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(wait) => {}
            }

            let blocks = engine.available_blocks(date, platform).await;
            tx.send_if_modified(|current| {
                if *current == blocks {
                    false
                } else {
                    *current = blocks;
                    true
                }
            });
        }
        metrics::gauge!(crate::observability::WATCHES_ACTIVE).decrement(1.0);
        debug!(platform = platform.label(), %date, "availability watch stopped");
    });

    AvailabilityWatch { rx, handle, token }
}

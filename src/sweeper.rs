use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{BookingError, Engine};
use crate::model::SessionCounts;

/// Compact the WAL once it has taken `threshold` appends since the last
/// compaction. Returns the compacted event count when it ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<Option<usize>, BookingError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(None);
    }
    let events = engine.compact_wal().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!(appends, events, "WAL compacted");
    Ok(Some(events))
}

/// Background task that keeps the WAL short.
pub async fn run_compactor(
    engine: Arc<Engine>,
    threshold: u64,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
    debug!("compactor stopped");
}

pub fn record_sessions(counts: &SessionCounts) {
    let gauge = crate::observability::SESSIONS;
    metrics::gauge!(gauge, "phase" => "scheduled").set(counts.scheduled as f64);
    metrics::gauge!(gauge, "phase" => "active").set(counts.active as f64);
    metrics::gauge!(gauge, "phase" => "awaiting_checkout").set(counts.awaiting_checkout as f64);
}

/// Background task that publishes how many upcoming bookings are scheduled,
/// running, or past their end without a checkout.
pub async fn run_session_sweeper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    let mut last_overdue = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let counts = engine.session_counts().await;
        record_sessions(&counts);
        if counts.awaiting_checkout != last_overdue {
            info!(awaiting_checkout = counts.awaiting_checkout, "sessions awaiting checkout");
            last_overdue = counts.awaiting_checkout;
        }
    }
    debug!("session sweeper stopped");
}

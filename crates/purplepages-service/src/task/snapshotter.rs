use std::sync::Arc;
use std::time::Duration;

use purplepages_analytics::AnalyticsDb;
use purplepages_core::Timestamp;
use purplepages_store::EventStore;
use purplepages_util::{BoxedErrorResult, FmtCompact as _, ShutdownToken};
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "purplepages::service::snapshotter";

/// Let startup traffic settle before the first measurement.
const INITIAL_DELAY: Duration = Duration::from_secs(5 * 60);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Daily storage-size and event-count snapshots, with a 30-day window kept
/// in the analytics store.
pub struct Snapshotter {
    store: Arc<EventStore>,
    analytics: Arc<AnalyticsDb>,
    initial_delay: Duration,
    interval: Duration,
    shutdown: ShutdownToken,
}

impl Snapshotter {
    pub fn new(
        store: Arc<EventStore>,
        analytics: Arc<AnalyticsDb>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            analytics,
            initial_delay: INITIAL_DELAY,
            interval: SNAPSHOT_INTERVAL,
            shutdown,
        }
    }

    /// Override the schedule; the one-shot analytics command and tests use
    /// tighter timings than the daily default.
    pub fn with_timing(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.interval = interval;
        self
    }

    pub async fn run(mut self) {
        debug!(target: LOG_TARGET, "Starting snapshotter");
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        loop {
            if let Err(err) = self.snapshot().await {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Snapshot failed");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!(target: LOG_TARGET, "Snapshotter stopped");
    }

    pub async fn snapshot(&self) -> BoxedErrorResult<()> {
        let now = Timestamp::now();
        let event_bytes = self.store.storage_bytes();
        let event_count = self.store.event_count().await?;

        self.analytics
            .record_storage_snapshot(now, event_bytes, event_count)
            .await?;
        // same cadence works for the rate-counter windows
        self.analytics.prune_request_counters(now).await?;

        info!(
            target: LOG_TARGET,
            event_bytes,
            event_count,
            "Storage snapshot recorded"
        );
        Ok(())
    }
}

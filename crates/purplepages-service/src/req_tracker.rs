use std::sync::{Arc, Mutex};
use std::time::Duration;

use purplepages_analytics::{pair_key, AnalyticsDb, ReqAnalyticsSnapshot};
use purplepages_core::{Filter, Timestamp};
use purplepages_util::{FmtCompact as _, ShutdownToken};
use tracing::{debug, warn};

const LOG_TARGET: &str = "purplepages::service::req_tracker";

/// How often the in-memory counters are flushed to the analytics store.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// In-memory aggregator for query telemetry.
///
/// Counters live behind one mutex with short critical sections; the
/// flusher drains them wholesale so a flush never blocks observers for
/// long.
#[derive(Debug, Default)]
pub struct RequestTracker {
    counters: Mutex<ReqAnalyticsSnapshot>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one filter's author references: per-pubkey, per-(pubkey,
    /// kind), and every unordered author pair in the same filter.
    pub fn observe_filter(&self, filter: &Filter) {
        let Some(authors) = &filter.authors else {
            return;
        };
        if authors.is_empty() {
            return;
        }

        let authors: Vec<_> = authors.iter().copied().collect();
        let mut counters = self.counters.lock().expect("Locking failed");
        for author in &authors {
            *counters.per_pubkey.entry(*author).or_default() += 1;
            if let Some(kinds) = &filter.kinds {
                for kind in kinds {
                    *counters
                        .per_pubkey_kind
                        .entry((*author, *kind))
                        .or_default() += 1;
                }
            }
        }
        for (i, a) in authors.iter().enumerate() {
            for b in &authors[i + 1..] {
                *counters.pairs.entry(pair_key(a, b)).or_default() += 1;
            }
        }
    }

    /// Drain the counters, leaving them empty for the next interval.
    pub fn take(&self) -> ReqAnalyticsSnapshot {
        std::mem::take(&mut *self.counters.lock().expect("Locking failed"))
    }

    /// Background flusher; drains to the analytics store every interval
    /// and once more on shutdown.
    pub async fn run_flusher(
        self: Arc<Self>,
        analytics: Arc<AnalyticsDb>,
        mut shutdown: ShutdownToken,
    ) {
        debug!(target: LOG_TARGET, "Starting request-analytics flusher");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
            }
            Self::flush(&self, &analytics).await;
        }
        // final drain so shutdown doesn't drop a window of telemetry
        Self::flush(&self, &analytics).await;
        debug!(target: LOG_TARGET, "Request-analytics flusher stopped");
    }

    async fn flush(tracker: &RequestTracker, analytics: &AnalyticsDb) {
        let snapshot = tracker.take();
        if snapshot.is_empty() {
            return;
        }
        if let Err(err) = analytics.flush_req_analytics(&snapshot, Timestamp::now()).await {
            warn!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                "Failed to flush request analytics"
            );
        }
    }
}

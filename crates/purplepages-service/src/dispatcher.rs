use std::collections::BTreeSet;
use std::sync::Arc;

use purplepages_analytics::AnalyticsDb;
use purplepages_core::{Event, Filter, Kind, Pubkey, Timestamp};
use purplepages_store::{EventStore, SaveOutcome, ScanPages, DEFAULT_SCAN_PAGE};
use purplepages_util::FmtCompact as _;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::admission::{AdmissionGate, Rejected};
use crate::req_tracker::RequestTracker;

const LOG_TARGET: &str = "purplepages::service::dispatcher";

/// Per-connection context the transport layer threads through every call.
#[derive(Debug, Clone)]
pub struct ConnectionCtx {
    pub ip: String,
    /// Set once the session authenticates (NIP-42); enables the
    /// trusted-follower rate-limit bypass.
    pub session_pubkey: Option<Pubkey>,
}

impl ConnectionCtx {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            session_pubkey: None,
        }
    }
}

/// Result of a publish, mapped by the transport onto an `OK` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Stored,
    /// Same id already stored; accepted without effect.
    Duplicate,
    /// A newer instance occupies the replacement slot; accepted as a no-op.
    Superseded,
    Rejected(Rejected),
}

impl PublishOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, PublishOutcome::Rejected(_))
    }

    pub fn reason(&self) -> String {
        match self {
            PublishOutcome::Stored => String::new(),
            PublishOutcome::Duplicate => "duplicate: already have this event".to_owned(),
            PublishOutcome::Superseded => "duplicate: have a newer event".to_owned(),
            PublishOutcome::Rejected(rejected) => format!("blocked: {}", rejected.reason),
        }
    }
}

/// Translates protocol operations into admission, storage and telemetry
/// calls.
///
/// Queries come back as a bounded channel the transport drains; dropping
/// the receiver cancels the producer, which still flushes its serve
/// counters on the way out.
pub struct Dispatcher {
    store: Arc<EventStore>,
    analytics: Arc<AnalyticsDb>,
    admission: Arc<AdmissionGate>,
    tracker: Arc<RequestTracker>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<EventStore>,
        analytics: Arc<AnalyticsDb>,
        admission: Arc<AdmissionGate>,
        tracker: Arc<RequestTracker>,
    ) -> Self {
        Self {
            store,
            analytics,
            admission,
            tracker,
        }
    }

    pub fn admission(&self) -> &AdmissionGate {
        &self.admission
    }

    pub async fn handle_publish(&self, event: &Event) -> PublishOutcome {
        if let Err(rejected) = self.admission.check_event(event).await {
            return PublishOutcome::Rejected(rejected);
        }
        match self.store.save(event).await {
            Ok(SaveOutcome::Saved) => PublishOutcome::Stored,
            Ok(SaveOutcome::Duplicate) => PublishOutcome::Duplicate,
            Ok(SaveOutcome::Superseded) => PublishOutcome::Superseded,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    event_id = %event.id,
                    err = %err.fmt_compact(),
                    "Event save failed"
                );
                PublishOutcome::Rejected(Rejected {
                    reason: "error: could not store event".to_owned(),
                })
            }
        }
    }

    /// Open a query stream. The producer serves each filter in turn and
    /// flushes per-IP and per-kind serve counters when it finishes or the
    /// receiver is dropped.
    pub async fn handle_req(
        &self,
        ctx: &ConnectionCtx,
        filters: Vec<Filter>,
    ) -> Result<mpsc::Receiver<Event>, Rejected> {
        self.admission
            .check_req(&ctx.ip, ctx.session_pubkey, &filters)
            .await?;

        for filter in &filters {
            self.tracker.observe_filter(filter);
        }

        let effective = self.effective_filters(filters).await;

        let (tx, rx) = mpsc::channel(64);
        let store = self.store.clone();
        let analytics = self.analytics.clone();
        let ip = ctx.ip.clone();
        tokio::spawn(async move {
            let mut served = 0u64;
            let mut served_kinds: BTreeSet<Kind> = BTreeSet::new();
            'filters: for filter in &effective {
                if let Some(kinds) = &filter.kinds {
                    served_kinds.extend(kinds.iter().copied());
                }
                let mut pages = ScanPages::new(&store, filter.clone(), DEFAULT_SCAN_PAGE);
                loop {
                    let batch = match pages.next_batch().await {
                        Ok(Some(batch)) => batch,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(
                                target: LOG_TARGET,
                                err = %err.fmt_compact(),
                                "Query stream failed"
                            );
                            break 'filters;
                        }
                    };
                    for event in batch {
                        if tx.send(event).await.is_err() {
                            // consumer cancelled; fall through to the flush
                            break 'filters;
                        }
                        served += 1;
                    }
                }
            }

            let now = Timestamp::now();
            if let Err(err) = analytics.record_request(&ip, served, now).await {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Failed to record serve counters"
                );
            }
            if let Err(err) = analytics.bump_req_kind_stats(served_kinds, now).await {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Failed to record kind stats"
                );
            }
            debug!(target: LOG_TARGET, ip = %ip, served, "Query stream finished");
        });

        Ok(rx)
    }

    pub async fn handle_count(
        &self,
        ctx: &ConnectionCtx,
        filters: Vec<Filter>,
    ) -> Result<u32, Rejected> {
        self.admission
            .check_req(&ctx.ip, ctx.session_pubkey, &filters)
            .await?;

        let mut total = 0u32;
        for filter in self.effective_filters(filters).await {
            match self.store.count(&filter).await {
                Ok(count) => total = total.saturating_add(count),
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        "Count failed"
                    );
                    return Err(Rejected {
                        reason: "error: count failed".to_owned(),
                    });
                }
            }
        }
        Ok(total)
    }

    /// Restrict each filter to the allowed kinds, recording the kinds that
    /// were asked for but are not served. Filters whose explicit kind list
    /// intersects to nothing are dropped entirely.
    async fn effective_filters(&self, filters: Vec<Filter>) -> Vec<Filter> {
        let allowed = self.admission.allowed_kinds();
        let max_limit = self.admission.limits().max_limit;

        let mut effective = Vec::with_capacity(filters.len());
        for mut filter in filters {
            let had_kinds = filter.kinds.is_some();
            let dropped = filter.intersect_kinds(allowed);
            for kind in dropped {
                if let Err(err) = self
                    .analytics
                    .record_rejected_req(kind, Timestamp::now())
                    .await
                {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        "Failed to count rejected kind"
                    );
                }
            }
            if had_kinds && filter.kinds.as_ref().is_some_and(|kinds| kinds.is_empty()) {
                continue;
            }
            filter.limit = Some(filter.limit.unwrap_or(max_limit).min(max_limit));
            effective.push(filter);
        }
        effective
    }
}

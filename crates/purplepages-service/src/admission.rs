use std::sync::Arc;

use purplepages_analytics::AnalyticsDb;
use purplepages_core::{Event, Filter, Pubkey, Timestamp};
use purplepages_util::FmtCompact as _;
use tracing::warn;

use crate::config::LimitsConfig;
use crate::KindAllowlist;

const LOG_TARGET: &str = "purplepages::service::admission";

/// A structured admission rejection; `reason` goes to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub reason: String,
}

impl Rejected {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Gates writes and reads before they reach storage.
///
/// Rejections are cheap and frequent; they are counted in the analytics
/// store but never logged as errors.
pub struct AdmissionGate {
    allowed_kinds: KindAllowlist,
    limits: LimitsConfig,
    analytics: Arc<AnalyticsDb>,
}

impl AdmissionGate {
    pub fn new(
        allowed_kinds: KindAllowlist,
        limits: LimitsConfig,
        analytics: Arc<AnalyticsDb>,
    ) -> Self {
        Self {
            allowed_kinds,
            limits,
            analytics,
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn allowed_kinds(&self) -> &KindAllowlist {
        &self.allowed_kinds
    }

    /// Write-path gate: kind whitelist, then tag and content caps.
    pub async fn check_event(&self, event: &Event) -> Result<(), Rejected> {
        if !self.allowed_kinds.contains(&event.kind) {
            if let Err(err) = self
                .analytics
                .record_rejected_event(event.kind, event.pubkey, Timestamp::now())
                .await
            {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Failed to count rejected event"
                );
            }
            return Err(Rejected::new(format!(
                "kind {} is not allowed",
                event.kind
            )));
        }
        if self.limits.max_event_tags < event.tags.len() {
            return Err(Rejected::new(format!(
                "too many tags: {} (max {})",
                event.tags.len(),
                self.limits.max_event_tags
            )));
        }
        if self.limits.max_content_length < event.content.len() {
            return Err(Rejected::new(format!(
                "content too large: {} (max {})",
                event.content.len(),
                self.limits.max_content_length
            )));
        }
        Ok(())
    }

    /// Read-path gate: limit cap, kind requirement, then the per-IP daily
    /// quota with the trusted-follower bypass.
    ///
    /// `trusted_follower_count` comes from the derived edge cache, so the
    /// decision tolerates one analyzer cycle of staleness.
    pub async fn check_req(
        &self,
        ip: &str,
        session_pubkey: Option<Pubkey>,
        filters: &[Filter],
    ) -> Result<(), Rejected> {
        for filter in filters {
            if let Some(limit) = filter.limit {
                if self.limits.max_limit < limit {
                    return Err(Rejected::new(format!(
                        "limit {} exceeds maximum {}",
                        limit, self.limits.max_limit
                    )));
                }
            }
            if filter.kinds.as_ref().is_none_or(|kinds| kinds.is_empty()) {
                return Err(Rejected::new("filters must specify kinds"));
            }
        }

        let served = self
            .analytics
            .events_served_last_24h(ip, Timestamp::now())
            .await
            .map_err(|err| {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Failed to read rate counters; refusing"
                );
                Rejected::new("internal error")
            })?;

        if served < self.limits.events_per_day_limit {
            return Ok(());
        }

        let Some(pubkey) = session_pubkey else {
            return Err(Rejected::new("auth-required: rate limit exceeded"));
        };

        let trusted_followers = self
            .analytics
            .trusted_follower_count(pubkey)
            .await
            .map_err(|err| {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Failed to read trusted followers; refusing"
                );
                Rejected::new("internal error")
            })?;

        if trusted_followers < self.limits.min_trusted_followers {
            return Err(Rejected::new("rate limit exceeded"));
        }
        Ok(())
    }
}

use std::collections::HashMap;

use purplepages_core::{Kind, Pubkey, Timestamp};
use serde::Serialize;

/// One flush of the in-memory request-analytics counters.
#[derive(Debug, Clone, Default)]
pub struct ReqAnalyticsSnapshot {
    /// Requests naming this pubkey as an author.
    pub per_pubkey: HashMap<Pubkey, u64>,
    /// Requests naming this (pubkey, kind) combination.
    pub per_pubkey_kind: HashMap<(Pubkey, Kind), u64>,
    /// Canonical `min:max` pair keys for pubkeys co-occurring in one filter.
    pub pairs: HashMap<String, u64>,
}

impl ReqAnalyticsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.per_pubkey.is_empty() && self.per_pubkey_kind.is_empty() && self.pairs.is_empty()
    }
}

/// A bot cluster as produced by the graph analyzer, pre-storage.
#[derive(Debug, Clone)]
pub struct BotClusterRecord {
    pub members: Vec<Pubkey>,
    pub internal_density: f64,
    pub external_ratio: f64,
}

/// A community partition as produced by the graph analyzer.
#[derive(Debug, Clone)]
pub struct CommunityRecord {
    pub id: i64,
    pub size: u64,
    pub modularity: f64,
    pub internal_edges: u64,
    pub external_edges: u64,
    pub top_members: Vec<Pubkey>,
}

/// Weighted edge between two communities.
#[derive(Debug, Clone, Copy)]
pub struct CommunityEdgeRecord {
    pub from_id: i64,
    pub to_id: i64,
    pub weight: u64,
}

/// Everything one derived-cache refresh rewrites, applied in a single
/// transaction.
#[derive(Debug, Clone, Default)]
pub struct DerivedCaches {
    pub follower_counts: HashMap<Pubkey, u64>,
    pub follower_edges: Vec<(Pubkey, Pubkey)>,
    pub most_muted: Vec<(Pubkey, u64)>,
    pub top_interests: Vec<(String, u64)>,
    pub relay_stats: Vec<(String, u64)>,
    pub social_counts: Vec<(String, u64)>,
    pub event_counts: HashMap<Kind, u64>,
    /// Follower-trend deltas are only accrued when the archive observes
    /// superseded contact lists; otherwise trends stay empty.
    pub accrue_trends: bool,
}

/// A discovered peer relay row.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRow {
    pub url: String,
    pub first_seen: Timestamp,
    pub last_sync_at: Option<Timestamp>,
    pub attempts: u64,
    pub successes: u64,
    pub events_contributed: u64,
    pub active: bool,
}

/// A spam candidate row.
#[derive(Debug, Clone, Serialize)]
pub struct SpamCandidateRow {
    pub pubkey: Pubkey,
    pub reason: String,
    pub event_count: u64,
    pub detected_at: Timestamp,
    pub purged: bool,
}

/// Why a pubkey was flagged as a spam candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamReason {
    /// Member of an active bot cluster and not trusted.
    BotCluster,
    /// Never named in any request and not trusted.
    NeverRequested,
}

impl SpamReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SpamReason::BotCluster => "bot-cluster",
            SpamReason::NeverRequested => "never-requested",
        }
    }
}

/// A daily storage snapshot row.
#[derive(Debug, Clone, Serialize)]
pub struct StorageSnapshotRow {
    pub day: String,
    pub event_bytes: u64,
    pub event_count: u64,
}

/// A rejected-write counter row.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEventRow {
    pub kind: Kind,
    pub pubkey: Pubkey,
    pub count: u64,
    pub last_seen: Timestamp,
}

/// A rejected-read counter row.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedReqRow {
    pub kind: Kind,
    pub count: u64,
    pub last_seen: Timestamp,
}

/// Follower-trend change row for one day and pubkey.
#[derive(Debug, Clone, Serialize)]
pub struct TrendRow {
    pub day: String,
    pub pubkey: Pubkey,
    pub gained: u64,
    pub lost: u64,
}

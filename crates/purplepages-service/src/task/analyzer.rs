use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use purplepages_analytics::{
    AnalyticsDb, BotClusterRecord, CommunityEdgeRecord, CommunityRecord, DerivedCaches,
    SpamReason,
};
use purplepages_core::{Filter, Kind, KindSet, Pubkey, Timestamp};
use purplepages_graph::{detect_bot_clusters, detect_communities, propagate_trust, tarjan, FollowGraph};
use purplepages_store::{EventStore, DEFAULT_SCAN_PAGE};
use purplepages_util::{BoxedErrorResult, FmtCompact as _, ShutdownToken};
use tracing::{debug, info, warn};

use crate::trusted_set::TrustedSet;

const LOG_TARGET: &str = "purplepages::service::analyzer";

/// Caps on the display caches; the stores behind them are unbounded.
const TOP_CACHE_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub interval: Duration,
    pub min_cluster_size: usize,
    pub trust_threshold: usize,
    pub min_community_size: usize,
    /// Kinds to maintain per-kind event counts for.
    pub counted_kinds: KindSet,
    /// Follower trends need the contact-list archive.
    pub archive_enabled: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            min_cluster_size: 3,
            trust_threshold: 10,
            min_community_size: 3,
            counted_kinds: KindSet::default_allowed(),
            archive_enabled: false,
        }
    }
}

/// The hourly graph-analysis cycle.
///
/// Each cycle reads the follow graph from the event store exactly once and
/// passes that snapshot to every step; two cycles never run concurrently
/// because the worker is a single task. Steps check for shutdown in
/// between, so a long cycle still stops promptly.
pub struct GraphAnalyzer {
    store: Arc<EventStore>,
    analytics: Arc<AnalyticsDb>,
    trusted: Arc<TrustedSet>,
    config: AnalyzerConfig,
    shutdown: ShutdownToken,
}

impl GraphAnalyzer {
    pub fn new(
        store: Arc<EventStore>,
        analytics: Arc<AnalyticsDb>,
        trusted: Arc<TrustedSet>,
        config: AnalyzerConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            analytics,
            trusted,
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            target: LOG_TARGET,
            interval_secs = self.config.interval.as_secs(),
            "Starting graph analyzer"
        );

        // an empty trusted set means a fresh database: analyze now instead
        // of making the admission bypass wait an hour
        if self.trusted.is_empty() {
            if let Err(err) = self.run_cycle().await {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Initial analysis failed");
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(err) = self.run_cycle().await {
                        warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Analysis cycle failed");
                    }
                }
            }
        }
        debug!(target: LOG_TARGET, "Graph analyzer stopped");
    }

    /// One full cycle: graph, clusters, trust, communities, caches, spam.
    pub async fn run_cycle(&self) -> BoxedErrorResult<()> {
        let started = std::time::Instant::now();

        let graph = self.build_graph().await?;
        debug!(
            target: LOG_TARGET,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Follow graph built"
        );
        if self.shutdown.is_shutdown() {
            return Ok(());
        }

        let sccs = tarjan(&graph);
        let clusters = detect_bot_clusters(&graph, &sccs, self.config.min_cluster_size);
        let cluster_records: Vec<BotClusterRecord> = clusters
            .iter()
            .map(|cluster| BotClusterRecord {
                members: cluster.members.clone(),
                internal_density: cluster.internal_density,
                external_ratio: cluster.external_ratio,
            })
            .collect();
        self.analytics
            .replace_bot_clusters(&cluster_records, Timestamp::now())
            .await?;
        if self.shutdown.is_shutdown() {
            return Ok(());
        }

        let seed = graph.largest_weakly_connected_component();
        let trusted = propagate_trust(&graph, &seed, self.config.trust_threshold);
        self.analytics.replace_trusted(&trusted).await?;
        self.trusted.replace(trusted.clone());
        if self.shutdown.is_shutdown() {
            return Ok(());
        }

        let community_graph = detect_communities(&graph, self.config.min_community_size);
        let nodes: Vec<CommunityRecord> = community_graph
            .communities
            .iter()
            .map(|community| CommunityRecord {
                id: community.id,
                size: community.members.len() as u64,
                modularity: community.modularity,
                internal_edges: community.internal_edges,
                external_edges: community.external_edges,
                top_members: community.top_members.clone(),
            })
            .collect();
        let edges: Vec<CommunityEdgeRecord> = community_graph
            .edges
            .iter()
            .map(|(from_id, to_id, weight)| CommunityEdgeRecord {
                from_id: *from_id,
                to_id: *to_id,
                weight: *weight,
            })
            .collect();
        self.analytics.replace_communities(&nodes, &edges).await?;
        if self.shutdown.is_shutdown() {
            return Ok(());
        }

        let caches = self.build_caches(&graph, trusted.len() as u64).await?;
        self.analytics
            .refresh_derived_caches(&caches, Timestamp::now())
            .await?;

        self.update_spam_candidates(&graph, &trusted).await?;

        info!(
            target: LOG_TARGET,
            nodes = graph.node_count(),
            clusters = clusters.len(),
            trusted = trusted.len(),
            communities = community_graph.communities.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Analysis cycle complete"
        );
        Ok(())
    }

    /// The cycle's one read of the follow graph: the latest contact list
    /// per author (the store keeps exactly one, kind 3 being replaceable).
    async fn build_graph(&self) -> BoxedErrorResult<FollowGraph> {
        let mut graph = FollowGraph::new();
        let filter = Filter {
            kinds: Some([Kind::CONTACTS].into()),
            ..Default::default()
        };
        self.store
            .scan(&filter, DEFAULT_SCAN_PAGE, |event| {
                let followees = event
                    .tag_values("p")
                    .filter_map(|value| value.parse::<Pubkey>().ok());
                graph.add_contact_list(event.pubkey, followees.collect::<Vec<_>>());
                ControlFlow::Continue(())
            })
            .await?;
        Ok(graph)
    }

    async fn build_caches(
        &self,
        graph: &FollowGraph,
        trusted_count: u64,
    ) -> BoxedErrorResult<DerivedCaches> {
        let follower_counts = graph.follower_counts();
        let follower_edges: Vec<(Pubkey, Pubkey)> = graph.edges().collect();

        let most_muted = self
            .count_tag_targets(Kind::MUTE_LIST, "p", |value| value.parse::<Pubkey>().ok())
            .await?;
        let top_interests = self
            .count_tag_targets(Kind::INTERESTS, "t", |value| {
                Some(value.to_lowercase())
            })
            .await?;
        let relay_stats = self
            .count_tag_targets(Kind::RELAY_LIST, "r", |value| {
                purplepages_sync::normalize_relay_url(value).ok()
            })
            .await?;

        let mut event_counts = HashMap::new();
        for kind in self.config.counted_kinds.iter() {
            let count = self
                .store
                .count(&Filter {
                    kinds: Some([kind].into()),
                    ..Default::default()
                })
                .await?;
            if 0 < count {
                event_counts.insert(kind, u64::from(count));
            }
        }

        let profiles = event_counts.get(&Kind::PROFILE).copied().unwrap_or(0);
        let contact_lists = event_counts.get(&Kind::CONTACTS).copied().unwrap_or(0);
        let relay_lists = event_counts.get(&Kind::RELAY_LIST).copied().unwrap_or(0);
        let social_counts = vec![
            ("contact_lists".to_owned(), contact_lists),
            ("follow_edges".to_owned(), graph.edge_count()),
            ("graph_nodes".to_owned(), graph.node_count() as u64),
            ("profiles".to_owned(), profiles),
            ("relay_lists".to_owned(), relay_lists),
            ("trusted_pubkeys".to_owned(), trusted_count),
        ];

        Ok(DerivedCaches {
            follower_counts,
            follower_edges,
            most_muted,
            top_interests,
            relay_stats,
            social_counts,
            event_counts,
            accrue_trends: self.config.archive_enabled,
        })
    }

    /// Count normalized tag values across the latest event of `kind` per
    /// author, descending, capped for display.
    async fn count_tag_targets<T: std::hash::Hash + Eq + Ord>(
        &self,
        kind: Kind,
        tag_name: &str,
        normalize: impl Fn(&str) -> Option<T>,
    ) -> BoxedErrorResult<Vec<(T, u64)>> {
        let mut counts: HashMap<T, u64> = HashMap::new();
        let filter = Filter {
            kinds: Some([kind].into()),
            ..Default::default()
        };
        self.store
            .scan(&filter, DEFAULT_SCAN_PAGE, |event| {
                for value in event.tag_values(tag_name) {
                    if let Some(target) = normalize(value) {
                        *counts.entry(target).or_default() += 1;
                    }
                }
                ControlFlow::Continue(())
            })
            .await?;

        let mut ranked: Vec<(T, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(TOP_CACHE_LIMIT);
        Ok(ranked)
    }

    /// Spam candidates: untrusted members of active bot clusters, and
    /// untrusted graph nodes nobody ever asked for.
    async fn update_spam_candidates(
        &self,
        graph: &FollowGraph,
        trusted: &std::collections::HashSet<Pubkey>,
    ) -> BoxedErrorResult<()> {
        let requested = self.analytics.requested_pubkeys().await?;
        let cluster_members = self.analytics.active_bot_cluster_members().await?;

        // one pass over the store for per-author event counts
        let mut author_counts: HashMap<Pubkey, u64> = HashMap::new();
        self.store
            .scan(&Filter::default(), DEFAULT_SCAN_PAGE, |event| {
                *author_counts.entry(event.pubkey).or_default() += 1;
                ControlFlow::Continue(())
            })
            .await?;

        let mut candidates: Vec<(Pubkey, SpamReason, u64)> = Vec::new();
        for member in &cluster_members {
            if trusted.contains(member) {
                continue;
            }
            candidates.push((
                *member,
                SpamReason::BotCluster,
                author_counts.get(member).copied().unwrap_or(0),
            ));
        }
        for node in graph.nodes() {
            if trusted.contains(node)
                || requested.contains(node)
                || cluster_members.contains(node)
            {
                continue;
            }
            candidates.push((
                *node,
                SpamReason::NeverRequested,
                author_counts.get(node).copied().unwrap_or(0),
            ));
        }

        self.analytics
            .upsert_spam_candidates(&candidates, Timestamp::now())
            .await?;
        debug!(target: LOG_TARGET, candidates = candidates.len(), "Spam candidates updated");
        Ok(())
    }
}

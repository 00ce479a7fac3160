use std::collections::HashSet;

use purplepages_core::{Pubkey, Timestamp};
use rusqlite::params;
use tracing::info;

use crate::{
    parse_pubkey, AnalyticsDb, AnalyticsResult, BotClusterRecord, CommunityEdgeRecord,
    CommunityRecord, SpamCandidateRow, SpamReason, LOG_TARGET,
};

impl AnalyticsDb {
    /// Replace the active bot-cluster set.
    ///
    /// Prior clusters are deactivated (their member rows stay, as history)
    /// and the new generation is inserted, all in one transaction.
    pub async fn replace_bot_clusters(
        &self,
        clusters: &[BotClusterRecord],
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("UPDATE bot_clusters SET active = 0 WHERE active = 1", [])?;
            {
                let mut cluster_stmt = tx.prepare_cached(
                    "INSERT INTO bot_clusters
                       (detected_at, size, internal_density, external_ratio, active)
                     VALUES (?1, ?2, ?3, ?4, 1)",
                )?;
                let mut member_stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO bot_cluster_members (cluster_id, pubkey)
                     VALUES (?1, ?2)",
                )?;
                for cluster in clusters {
                    cluster_stmt.execute(params![
                        now.as_secs(),
                        cluster.members.len() as u64,
                        cluster.internal_density,
                        cluster.external_ratio,
                    ])?;
                    let cluster_id = tx.last_insert_rowid();
                    for member in &cluster.members {
                        member_stmt.execute(params![cluster_id, member.to_string()])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        info!(
            target: LOG_TARGET,
            clusters = clusters.len(),
            "Replaced active bot clusters"
        );
        Ok(())
    }

    /// Members of every active bot cluster.
    pub async fn active_bot_cluster_members(&self) -> AnalyticsResult<HashSet<Pubkey>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT m.pubkey FROM bot_cluster_members m
                 JOIN bot_clusters c ON c.id = m.cluster_id
                 WHERE c.active = 1",
            )?;
            let mut members = HashSet::new();
            let rows = stmt.query_map([], |row| parse_pubkey(row.get::<_, String>(0)?))?;
            for row in rows {
                members.insert(row?);
            }
            Ok(members)
        })
        .await
    }

    pub async fn active_bot_cluster_count(&self) -> AnalyticsResult<u64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM bot_clusters WHERE active = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    /// Atomically replace the persisted trusted set.
    pub async fn replace_trusted(&self, trusted: &HashSet<Pubkey>) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM trusted_pubkeys", [])?;
            {
                let mut stmt =
                    tx.prepare_cached("INSERT INTO trusted_pubkeys (pubkey) VALUES (?1)")?;
                for pubkey in trusted {
                    stmt.execute(params![pubkey.to_string()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn trusted_pubkeys(&self) -> AnalyticsResult<HashSet<Pubkey>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT pubkey FROM trusted_pubkeys")?;
            let mut trusted = HashSet::new();
            let rows = stmt.query_map([], |row| parse_pubkey(row.get::<_, String>(0)?))?;
            for row in rows {
                trusted.insert(row?);
            }
            Ok(trusted)
        })
        .await
    }

    pub async fn trusted_count(&self) -> AnalyticsResult<u64> {
        self.with_conn(|conn| {
            let count =
                conn.query_row("SELECT COUNT(*) FROM trusted_pubkeys", [], |row| row.get(0))?;
            Ok(count)
        })
        .await
    }

    /// How many of `pubkey`'s followers are currently trusted, from the
    /// cached follower-edge table.
    pub async fn trusted_follower_count(&self, pubkey: Pubkey) -> AnalyticsResult<u64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM cached_follower_edges e
                 JOIN trusted_pubkeys t ON t.pubkey = e.follower
                 WHERE e.followed = ?1",
                params![pubkey.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    /// Replace the community partition, nodes and inter-community edges.
    pub async fn replace_communities(
        &self,
        nodes: &[CommunityRecord],
        edges: &[CommunityEdgeRecord],
    ) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM community_nodes", [])?;
            tx.execute("DELETE FROM community_edges", [])?;
            {
                let mut node_stmt = tx.prepare_cached(
                    "INSERT INTO community_nodes
                       (id, size, modularity, internal_edges, external_edges, top_members)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for node in nodes {
                    let top_members = node
                        .top_members
                        .iter()
                        .map(Pubkey::to_string)
                        .collect::<Vec<_>>()
                        .join(",");
                    node_stmt.execute(params![
                        node.id,
                        node.size,
                        node.modularity,
                        node.internal_edges,
                        node.external_edges,
                        top_members,
                    ])?;
                }

                let mut edge_stmt = tx.prepare_cached(
                    "INSERT INTO community_edges (from_id, to_id, weight) VALUES (?1, ?2, ?3)",
                )?;
                for edge in edges {
                    edge_stmt.execute(params![edge.from_id, edge.to_id, edge.weight])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn communities(&self) -> AnalyticsResult<Vec<CommunityRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, size, modularity, internal_edges, external_edges, top_members
                 FROM community_nodes ORDER BY size DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                let top_members: String = row.get(5)?;
                let top_members = top_members
                    .split(',')
                    .filter(|part| !part.is_empty())
                    .map(|part| parse_pubkey(part.to_owned()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CommunityRecord {
                    id: row.get(0)?,
                    size: row.get(1)?,
                    modularity: row.get(2)?,
                    internal_edges: row.get(3)?,
                    external_edges: row.get(4)?,
                    top_members,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn community_edges(&self) -> AnalyticsResult<Vec<CommunityEdgeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT from_id, to_id, weight FROM community_edges ORDER BY weight DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CommunityEdgeRecord {
                    from_id: row.get(0)?,
                    to_id: row.get(1)?,
                    weight: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Upsert the spam-candidate list. A candidate that was already purged
    /// keeps its purged flag; re-detection refreshes reason and counts only.
    pub async fn upsert_spam_candidates(
        &self,
        candidates: &[(Pubkey, SpamReason, u64)],
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO spam_candidates (pubkey, reason, event_count, detected_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(pubkey) DO UPDATE SET
                       reason = excluded.reason,
                       event_count = excluded.event_count,
                       detected_at = excluded.detected_at",
                )?;
                for (pubkey, reason, event_count) in candidates {
                    stmt.execute(params![
                        pubkey.to_string(),
                        reason.as_str(),
                        event_count,
                        now.as_secs(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn unpurged_spam_candidates(&self) -> AnalyticsResult<Vec<SpamCandidateRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT pubkey, reason, event_count, detected_at, purged
                 FROM spam_candidates WHERE purged = 0
                 ORDER BY event_count DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SpamCandidateRow {
                    pubkey: parse_pubkey(row.get::<_, String>(0)?)?,
                    reason: row.get(1)?,
                    event_count: row.get(2)?,
                    detected_at: Timestamp::from_secs(row.get(3)?),
                    purged: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn mark_spam_purged(&self, pubkeys: &[Pubkey]) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE spam_candidates SET purged = 1 WHERE pubkey = ?1",
                )?;
                for pubkey in pubkeys {
                    stmt.execute(params![pubkey.to_string()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Pubkeys that have ever been named in a request (for spam detection).
    pub async fn requested_pubkeys(&self) -> AnalyticsResult<HashSet<Pubkey>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT pubkey FROM request_telemetry")?;
            let mut requested = HashSet::new();
            let rows = stmt.query_map([], |row| parse_pubkey(row.get::<_, String>(0)?))?;
            for row in rows {
                requested.insert(row?);
            }
            Ok(requested)
        })
        .await
    }
}

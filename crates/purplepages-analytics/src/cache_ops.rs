use std::collections::{HashMap, HashSet};

use purplepages_core::{Pubkey, Timestamp};
use rusqlite::params;
use tracing::info;

use crate::{
    day_string, parse_pubkey, AnalyticsDb, AnalyticsResult, DerivedCaches, TrendRow, LOG_TARGET,
};

/// Days of follower-trend history kept.
const TREND_WINDOW_DAYS: u64 = 30;

impl AnalyticsDb {
    /// Rewrite every derived cache in one transaction.
    ///
    /// Readers either see the previous generation or the new one, never a
    /// mix. Trend deltas are accrued from the edge diff before the edge
    /// table is overwritten.
    pub async fn refresh_derived_caches(
        &self,
        caches: &DerivedCaches,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        let day = day_string(now);
        let cutoff = day_string(now.saturating_sub(TREND_WINDOW_DAYS * 86400));

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            if caches.accrue_trends {
                let mut old_edges: HashSet<(Pubkey, Pubkey)> = HashSet::new();
                {
                    let mut stmt = tx
                        .prepare_cached("SELECT follower, followed FROM cached_follower_edges")?;
                    let rows = stmt.query_map([], |row| {
                        Ok((
                            parse_pubkey(row.get::<_, String>(0)?)?,
                            parse_pubkey(row.get::<_, String>(1)?)?,
                        ))
                    })?;
                    for row in rows {
                        old_edges.insert(row?);
                    }
                }

                let new_edges: HashSet<(Pubkey, Pubkey)> =
                    caches.follower_edges.iter().copied().collect();

                let mut gained: HashMap<Pubkey, u64> = HashMap::new();
                let mut lost: HashMap<Pubkey, u64> = HashMap::new();
                for (_, followed) in new_edges.difference(&old_edges) {
                    *gained.entry(*followed).or_default() += 1;
                }
                for (_, followed) in old_edges.difference(&new_edges) {
                    *lost.entry(*followed).or_default() += 1;
                }

                // first refresh after startup sees an empty old table;
                // don't count the whole graph as gained that day
                if !old_edges.is_empty() {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO follower_trend_changes (day, pubkey, gained, lost)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(day, pubkey) DO UPDATE SET
                           gained = gained + excluded.gained,
                           lost = lost + excluded.lost",
                    )?;
                    let followed: HashSet<Pubkey> =
                        gained.keys().chain(lost.keys()).copied().collect();
                    for pubkey in followed {
                        stmt.execute(params![
                            day,
                            pubkey.to_string(),
                            gained.get(&pubkey).copied().unwrap_or(0),
                            lost.get(&pubkey).copied().unwrap_or(0),
                        ])?;
                    }
                }
                tx.execute(
                    "DELETE FROM follower_trend_changes WHERE day < ?1",
                    params![cutoff],
                )?;
            }

            tx.execute("DELETE FROM cached_follower_counts", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO cached_follower_counts (pubkey, count) VALUES (?1, ?2)",
                )?;
                for (pubkey, count) in &caches.follower_counts {
                    stmt.execute(params![pubkey.to_string(), count])?;
                }
            }

            tx.execute("DELETE FROM cached_follower_edges", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO cached_follower_edges (follower, followed)
                     VALUES (?1, ?2)",
                )?;
                for (follower, followed) in &caches.follower_edges {
                    stmt.execute(params![follower.to_string(), followed.to_string()])?;
                }
            }

            tx.execute("DELETE FROM cached_most_muted", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO cached_most_muted (pubkey, mute_count) VALUES (?1, ?2)",
                )?;
                for (pubkey, count) in &caches.most_muted {
                    stmt.execute(params![pubkey.to_string(), count])?;
                }
            }

            tx.execute("DELETE FROM cached_top_interests", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO cached_top_interests (topic, count) VALUES (?1, ?2)",
                )?;
                for (topic, count) in &caches.top_interests {
                    stmt.execute(params![topic, count])?;
                }
            }

            tx.execute("DELETE FROM cached_relay_stats", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO cached_relay_stats (url, reference_count) VALUES (?1, ?2)",
                )?;
                for (url, count) in &caches.relay_stats {
                    stmt.execute(params![url, count])?;
                }
            }

            tx.execute("DELETE FROM cached_social_counts", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO cached_social_counts (name, value) VALUES (?1, ?2)",
                )?;
                for (name, value) in &caches.social_counts {
                    stmt.execute(params![name, value])?;
                }
            }

            tx.execute("DELETE FROM cached_event_counts", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO cached_event_counts (kind, count) VALUES (?1, ?2)",
                )?;
                for (kind, count) in &caches.event_counts {
                    stmt.execute(params![kind.as_u16(), count])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await?;

        info!(
            target: LOG_TARGET,
            followers = caches.follower_counts.len(),
            edges = caches.follower_edges.len(),
            "Refreshed derived caches"
        );
        Ok(())
    }

    pub async fn follower_count(&self, pubkey: Pubkey) -> AnalyticsResult<u64> {
        use rusqlite::OptionalExtension as _;
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM cached_follower_counts WHERE pubkey = ?1",
                    params![pubkey.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
        .await
    }

    pub async fn top_follower_counts(
        &self,
        limit: usize,
    ) -> AnalyticsResult<Vec<(Pubkey, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT pubkey, count FROM cached_follower_counts
                 ORDER BY count DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((parse_pubkey(row.get::<_, String>(0)?)?, row.get(1)?))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn recent_trends(&self, limit: usize) -> AnalyticsResult<Vec<TrendRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT day, pubkey, gained, lost FROM follower_trend_changes
                 ORDER BY day DESC, gained + lost DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(TrendRow {
                    day: row.get(0)?,
                    pubkey: parse_pubkey(row.get::<_, String>(1)?)?,
                    gained: row.get(2)?,
                    lost: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

use purplepages_core::{Pubkey, Timestamp};
use rusqlite::{params, OptionalExtension as _};

use crate::{parse_pubkey, AnalyticsDb, AnalyticsResult, PeerRow};

fn peer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRow> {
    Ok(PeerRow {
        url: row.get(0)?,
        first_seen: Timestamp::from_secs(row.get(1)?),
        last_sync_at: row.get::<_, Option<u64>>(2)?.map(Timestamp::from_secs),
        attempts: row.get(3)?,
        successes: row.get(4)?,
        events_contributed: row.get(5)?,
        active: row.get(6)?,
    })
}

impl AnalyticsDb {
    /// Register a discovered relay. Returns true when the URL is new.
    pub async fn upsert_discovered_relay(
        &self,
        url: &str,
        now: Timestamp,
    ) -> AnalyticsResult<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO discovered_relays (url, first_seen) VALUES (?1, ?2)
                 ON CONFLICT(url) DO NOTHING",
                params![url, now.as_secs()],
            )?;
            Ok(0 < inserted)
        })
        .await
    }

    /// Active peers ordered by `last_sync_at` ascending; never-synced peers
    /// sort first (SQLite sorts NULL lowest).
    pub async fn active_relays_oldest_first(
        &self,
        limit: usize,
    ) -> AnalyticsResult<Vec<PeerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT url, first_seen, last_sync_at, attempts, successes,
                        events_contributed, active
                 FROM discovered_relays
                 WHERE active = 1
                 ORDER BY last_sync_at ASC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], peer_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Record one sync cycle against a peer: one attempt, a success iff
    /// every kind-sync in the cycle finished cleanly.
    pub async fn record_relay_sync(
        &self,
        url: &str,
        ok: bool,
        contributed: u64,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE discovered_relays SET
                   attempts = attempts + 1,
                   successes = successes + ?2,
                   events_contributed = events_contributed + ?3,
                   last_sync_at = ?4
                 WHERE url = ?1",
                params![url, u64::from(ok), contributed, now.as_secs()],
            )?;
            Ok(())
        })
        .await
    }

    /// Flag a peer inactive. Peers are never pruned, only flagged.
    pub async fn mark_relay_inactive(&self, url: &str) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE discovered_relays SET active = 0 WHERE url = ?1",
                params![url],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_relays(&self, limit: usize) -> AnalyticsResult<Vec<PeerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT url, first_seen, last_sync_at, attempts, successes,
                        events_contributed, active
                 FROM discovered_relays
                 ORDER BY events_contributed DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], peer_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn relay_count(&self) -> AnalyticsResult<u64> {
        self.with_conn(|conn| {
            let count =
                conn.query_row("SELECT COUNT(*) FROM discovered_relays", [], |row| {
                    row.get(0)
                })?;
            Ok(count)
        })
        .await
    }

    /// Per-author sync bookmark for the trusted syncer.
    pub async fn get_last_synced(&self, pubkey: Pubkey) -> AnalyticsResult<Option<Timestamp>> {
        self.with_conn(|conn| {
            let ts: Option<u64> = conn
                .query_row(
                    "SELECT last_synced_at FROM peer_sync_state WHERE pubkey = ?1",
                    params![pubkey.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(ts.map(Timestamp::from_secs))
        })
        .await
    }

    pub async fn set_last_synced(
        &self,
        pubkey: Pubkey,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO peer_sync_state (pubkey, last_synced_at) VALUES (?1, ?2)
                 ON CONFLICT(pubkey) DO UPDATE SET last_synced_at = excluded.last_synced_at",
                params![pubkey.to_string(), now.as_secs()],
            )?;
            Ok(())
        })
        .await
    }

    /// Full sync-bookmark map; the trusted syncer orders its batch with it.
    pub async fn last_synced_all(
        &self,
    ) -> AnalyticsResult<std::collections::HashMap<Pubkey, Timestamp>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT pubkey, last_synced_at FROM peer_sync_state")?;
            let mut map = std::collections::HashMap::new();
            let rows = stmt.query_map([], |row| {
                Ok((
                    parse_pubkey(row.get::<_, String>(0)?)?,
                    Timestamp::from_secs(row.get(1)?),
                ))
            })?;
            for row in rows {
                let (pubkey, ts) = row?;
                map.insert(pubkey, ts);
            }
            Ok(map)
        })
        .await
    }

    /// Per-(relay, author) hit counters for the trusted syncer.
    pub async fn record_peer_author_stats(
        &self,
        relay_url: &str,
        pubkey: Pubkey,
        hits: u64,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO peer_sync_stats (relay_url, pubkey, events, last_attempt)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(relay_url, pubkey) DO UPDATE SET
                   events = events + excluded.events,
                   last_attempt = excluded.last_attempt",
                params![relay_url, pubkey.to_string(), hits, now.as_secs()],
            )?;
            Ok(())
        })
        .await
    }
}

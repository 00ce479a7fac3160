//! Read queries backing the stats endpoints.

use purplepages_core::{Kind, Pubkey, Timestamp};
use rusqlite::{params, OptionalExtension as _};

use crate::{parse_pubkey, AnalyticsDb, AnalyticsResult, RejectedEventRow, RejectedReqRow};

impl AnalyticsDb {
    pub async fn rejected_event_rows(
        &self,
        limit: usize,
    ) -> AnalyticsResult<Vec<RejectedEventRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT kind, pubkey, count, last_seen FROM rejected_events
                 ORDER BY count DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(RejectedEventRow {
                    kind: Kind::new(row.get(0)?),
                    pubkey: parse_pubkey(row.get::<_, String>(1)?)?,
                    count: row.get(2)?,
                    last_seen: Timestamp::from_secs(row.get(3)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn rejected_req_rows(&self) -> AnalyticsResult<Vec<RejectedReqRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT kind, count, last_seen FROM rejected_reqs ORDER BY count DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RejectedReqRow {
                    kind: Kind::new(row.get(0)?),
                    count: row.get(1)?,
                    last_seen: Timestamp::from_secs(row.get(2)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn rejected_event_count(&self, kind: Kind, pubkey: Pubkey) -> AnalyticsResult<u64> {
        self.with_conn(|conn| {
            let count: Option<u64> = conn
                .query_row(
                    "SELECT count FROM rejected_events WHERE kind = ?1 AND pubkey = ?2",
                    params![kind.as_u16(), pubkey.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
        .await
    }

    pub async fn req_kind_stats_rows(&self) -> AnalyticsResult<Vec<(Kind, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT kind, count FROM req_kind_stats ORDER BY count DESC",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((Kind::new(row.get(0)?), row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn most_muted(&self, limit: usize) -> AnalyticsResult<Vec<(Pubkey, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT pubkey, mute_count FROM cached_most_muted
                 ORDER BY mute_count DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((parse_pubkey(row.get::<_, String>(0)?)?, row.get(1)?))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn top_interests(&self, limit: usize) -> AnalyticsResult<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT topic, count FROM cached_top_interests
                 ORDER BY count DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn relay_stats(&self, limit: usize) -> AnalyticsResult<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT url, reference_count FROM cached_relay_stats
                 ORDER BY reference_count DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn social_counts(&self) -> AnalyticsResult<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT name, value FROM cached_social_counts ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn event_counts(&self) -> AnalyticsResult<Vec<(Kind, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT kind, count FROM cached_event_counts ORDER BY count DESC",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((Kind::new(row.get(0)?), row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn request_total(&self, pubkey: Pubkey) -> AnalyticsResult<u64> {
        self.with_conn(|conn| {
            let total: Option<u64> = conn
                .query_row(
                    "SELECT total FROM request_telemetry WHERE pubkey = ?1",
                    params![pubkey.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(total.unwrap_or(0))
        })
        .await
    }

    pub async fn top_requested(&self, limit: usize) -> AnalyticsResult<Vec<(Pubkey, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT pubkey, total FROM request_telemetry ORDER BY total DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((parse_pubkey(row.get::<_, String>(0)?)?, row.get(1)?))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Per-kind request breakdown for one pubkey.
    pub async fn request_kind_breakdown(
        &self,
        pubkey: Pubkey,
    ) -> AnalyticsResult<Vec<(Kind, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT kind, total FROM request_telemetry_by_kind
                 WHERE pubkey = ?1 ORDER BY total DESC",
            )?;
            let rows = stmt
                .query_map(params![pubkey.to_string()], |row| {
                    Ok((Kind::new(row.get(0)?), row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Recent daily request-kind series, newest day first.
    pub async fn daily_req_kind_series(
        &self,
        limit: usize,
    ) -> AnalyticsResult<Vec<(String, Kind, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT day, kind, count FROM req_kind_stats_daily
                 ORDER BY day DESC, count DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((row.get(0)?, Kind::new(row.get(1)?), row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Most productive (relay, author) pairs seen by the trusted syncer.
    pub async fn top_peer_author_stats(
        &self,
        limit: usize,
    ) -> AnalyticsResult<Vec<(String, Pubkey, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT relay_url, pubkey, events FROM peer_sync_stats
                 ORDER BY events DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((
                        row.get(0)?,
                        parse_pubkey(row.get::<_, String>(1)?)?,
                        row.get(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn top_cooccurrence(&self, limit: usize) -> AnalyticsResult<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT pair_key, count FROM request_cooccurrence
                 ORDER BY count DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

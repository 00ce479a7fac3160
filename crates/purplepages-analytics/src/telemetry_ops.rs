use purplepages_core::{Kind, Pubkey, Timestamp};
use rusqlite::params;
use tracing::debug;

use crate::{day_string, AnalyticsDb, AnalyticsResult, ReqAnalyticsSnapshot, LOG_TARGET};

impl AnalyticsDb {
    /// Apply one flush of the in-memory request counters.
    ///
    /// Upserts are additive and idempotent per flush; a crashed flush is
    /// simply re-counted from fresh in-memory state.
    pub async fn flush_req_analytics(
        &self,
        snapshot: &ReqAnalyticsSnapshot,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        if snapshot.is_empty() {
            return Ok(());
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO request_telemetry (pubkey, total, last_seen)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(pubkey) DO UPDATE SET
                       total = total + excluded.total,
                       last_seen = excluded.last_seen",
                )?;
                for (pubkey, count) in &snapshot.per_pubkey {
                    stmt.execute(params![pubkey.to_string(), count, now.as_secs()])?;
                }

                let mut stmt = tx.prepare_cached(
                    "INSERT INTO request_telemetry_by_kind (pubkey, kind, total, last_seen)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(pubkey, kind) DO UPDATE SET
                       total = total + excluded.total,
                       last_seen = excluded.last_seen",
                )?;
                for ((pubkey, kind), count) in &snapshot.per_pubkey_kind {
                    stmt.execute(params![
                        pubkey.to_string(),
                        kind.as_u16(),
                        count,
                        now.as_secs()
                    ])?;
                }

                let mut stmt = tx.prepare_cached(
                    "INSERT INTO request_cooccurrence (pair_key, count, last_seen)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(pair_key) DO UPDATE SET
                       count = count + excluded.count,
                       last_seen = excluded.last_seen",
                )?;
                for (pair, count) in &snapshot.pairs {
                    stmt.execute(params![pair, count, now.as_secs()])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(
            target: LOG_TARGET,
            pubkeys = snapshot.per_pubkey.len(),
            pairs = snapshot.pairs.len(),
            "Flushed request analytics"
        );
        Ok(())
    }

    /// Count a rejected write for `(kind, pubkey)`.
    pub async fn record_rejected_event(
        &self,
        kind: Kind,
        pubkey: Pubkey,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rejected_events (kind, pubkey, count, last_seen)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(kind, pubkey) DO UPDATE SET
                   count = count + 1,
                   last_seen = excluded.last_seen",
                params![kind.as_u16(), pubkey.to_string(), now.as_secs()],
            )?;
            Ok(())
        })
        .await
    }

    /// Count a read rejected because it asked for a disallowed kind.
    pub async fn record_rejected_req(&self, kind: Kind, now: Timestamp) -> AnalyticsResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rejected_reqs (kind, count, last_seen)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(kind) DO UPDATE SET
                   count = count + 1,
                   last_seen = excluded.last_seen",
                params![kind.as_u16(), now.as_secs()],
            )?;
            Ok(())
        })
        .await
    }

    /// Count served request kinds, total and per day.
    pub async fn bump_req_kind_stats(
        &self,
        kinds: impl IntoIterator<Item = Kind>,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        let day = day_string(now);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut total_stmt = tx.prepare_cached(
                    "INSERT INTO req_kind_stats (kind, count, last_seen)
                     VALUES (?1, 1, ?2)
                     ON CONFLICT(kind) DO UPDATE SET
                       count = count + 1,
                       last_seen = excluded.last_seen",
                )?;
                let mut daily_stmt = tx.prepare_cached(
                    "INSERT INTO req_kind_stats_daily (day, kind, count)
                     VALUES (?1, ?2, 1)
                     ON CONFLICT(day, kind) DO UPDATE SET count = count + 1",
                )?;
                for kind in kinds {
                    total_stmt.execute(params![kind.as_u16(), now.as_secs()])?;
                    daily_stmt.execute(params![day, kind.as_u16()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

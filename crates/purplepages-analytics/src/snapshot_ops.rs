use purplepages_core::Timestamp;
use rusqlite::params;

use crate::{day_string, AnalyticsDb, AnalyticsResult, StorageSnapshotRow};

/// Days of storage snapshots kept.
const SNAPSHOT_WINDOW_DAYS: u64 = 30;

impl AnalyticsDb {
    /// Record today's storage snapshot and prune the rolling window.
    pub async fn record_storage_snapshot(
        &self,
        now: Timestamp,
        event_bytes: u64,
        event_count: u64,
    ) -> AnalyticsResult<()> {
        let day = day_string(now);
        let cutoff = day_string(now.saturating_sub(SNAPSHOT_WINDOW_DAYS * 86400));
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO daily_storage_stats (day, event_bytes, event_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(day) DO UPDATE SET
                   event_bytes = excluded.event_bytes,
                   event_count = excluded.event_count",
                params![day, event_bytes, event_count],
            )?;
            tx.execute(
                "DELETE FROM daily_storage_stats WHERE day < ?1",
                params![cutoff],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn storage_history(&self) -> AnalyticsResult<Vec<StorageSnapshotRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT day, event_bytes, event_count FROM daily_storage_stats
                 ORDER BY day DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StorageSnapshotRow {
                    day: row.get(0)?,
                    event_bytes: row.get(1)?,
                    event_count: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

use purplepages_core::Timestamp;
use rusqlite::params;

use crate::{day_string, AnalyticsDb, AnalyticsResult};

impl AnalyticsDb {
    /// Record one request from `ip` that served `served` events.
    ///
    /// Counters are additive, so `events_served` is monotone within a
    /// bucket; admission reads may lag by one flush interval at most.
    pub async fn record_request(
        &self,
        ip: &str,
        served: u64,
        now: Timestamp,
    ) -> AnalyticsResult<()> {
        let day = day_string(now);
        let hour = now.hour_bucket();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO daily_requests (day, ip, request_count, events_served)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(day, ip) DO UPDATE SET
                   request_count = request_count + 1,
                   events_served = events_served + excluded.events_served",
                params![day, ip, served],
            )?;
            tx.execute(
                "INSERT INTO hourly_requests (hour, ip, request_count, events_served)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(hour, ip) DO UPDATE SET
                   request_count = request_count + 1,
                   events_served = events_served + excluded.events_served",
                params![hour, ip, served],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Events served to `ip` over the last 24 hour buckets.
    pub async fn events_served_last_24h(
        &self,
        ip: &str,
        now: Timestamp,
    ) -> AnalyticsResult<u64> {
        let oldest_hour = now.hour_bucket().saturating_sub(23);
        self.with_conn(|conn| {
            let served: u64 = conn.query_row(
                "SELECT COALESCE(SUM(events_served), 0) FROM hourly_requests
                 WHERE ip = ?1 AND ?2 <= hour",
                params![ip, oldest_hour],
                |row| row.get(0),
            )?;
            Ok(served)
        })
        .await
    }

    /// Drop request counters old enough that nothing reads them anymore:
    /// hourly buckets past 48 hours, daily rows past 60 days.
    pub async fn prune_request_counters(&self, now: Timestamp) -> AnalyticsResult<()> {
        let oldest_hour = now.hour_bucket().saturating_sub(48);
        let oldest_day = day_string(now.saturating_sub(60 * 86400));
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM hourly_requests WHERE hour < ?1",
                params![oldest_hour],
            )?;
            conn.execute(
                "DELETE FROM daily_requests WHERE day < ?1",
                params![oldest_day],
            )?;
            Ok(())
        })
        .await
    }
}

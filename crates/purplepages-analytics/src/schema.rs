use rusqlite::Connection;

use crate::AnalyticsResult;

/// Create every table this store uses. Idempotent; runs at open.
pub(crate) fn init(conn: &Connection) -> AnalyticsResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS request_telemetry (
            pubkey    TEXT PRIMARY KEY,
            total     INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS request_telemetry_by_kind (
            pubkey    TEXT NOT NULL,
            kind      INTEGER NOT NULL,
            total     INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (pubkey, kind)
        );

        CREATE TABLE IF NOT EXISTS request_cooccurrence (
            pair_key  TEXT PRIMARY KEY,
            count     INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bot_clusters (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            detected_at      INTEGER NOT NULL,
            size             INTEGER NOT NULL,
            internal_density REAL NOT NULL,
            external_ratio   REAL NOT NULL,
            active           INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS bot_cluster_members (
            cluster_id INTEGER NOT NULL,
            pubkey     TEXT NOT NULL,
            PRIMARY KEY (cluster_id, pubkey)
        );

        CREATE TABLE IF NOT EXISTS spam_candidates (
            pubkey      TEXT PRIMARY KEY,
            reason      TEXT NOT NULL,
            event_count INTEGER NOT NULL,
            detected_at INTEGER NOT NULL,
            purged      INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS rejected_events (
            kind      INTEGER NOT NULL,
            pubkey    TEXT NOT NULL,
            count     INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (kind, pubkey)
        );

        CREATE TABLE IF NOT EXISTS rejected_reqs (
            kind      INTEGER PRIMARY KEY,
            count     INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS req_kind_stats (
            kind      INTEGER PRIMARY KEY,
            count     INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS req_kind_stats_daily (
            day   TEXT NOT NULL,
            kind  INTEGER NOT NULL,
            count INTEGER NOT NULL,
            PRIMARY KEY (day, kind)
        );

        CREATE TABLE IF NOT EXISTS discovered_relays (
            url                TEXT PRIMARY KEY,
            first_seen         INTEGER NOT NULL,
            last_sync_at       INTEGER,
            attempts           INTEGER NOT NULL DEFAULT 0,
            successes          INTEGER NOT NULL DEFAULT 0,
            events_contributed INTEGER NOT NULL DEFAULT 0,
            active             INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS peer_sync_state (
            pubkey         TEXT PRIMARY KEY,
            last_synced_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS peer_sync_stats (
            relay_url    TEXT NOT NULL,
            pubkey       TEXT NOT NULL,
            events       INTEGER NOT NULL,
            last_attempt INTEGER NOT NULL,
            PRIMARY KEY (relay_url, pubkey)
        );

        CREATE TABLE IF NOT EXISTS daily_requests (
            day           TEXT NOT NULL,
            ip            TEXT NOT NULL,
            request_count INTEGER NOT NULL,
            events_served INTEGER NOT NULL,
            PRIMARY KEY (day, ip)
        );

        CREATE TABLE IF NOT EXISTS hourly_requests (
            hour          INTEGER NOT NULL,
            ip            TEXT NOT NULL,
            request_count INTEGER NOT NULL,
            events_served INTEGER NOT NULL,
            PRIMARY KEY (hour, ip)
        );

        CREATE TABLE IF NOT EXISTS daily_storage_stats (
            day         TEXT PRIMARY KEY,
            event_bytes INTEGER NOT NULL,
            event_count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_follower_counts (
            pubkey TEXT PRIMARY KEY,
            count  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_follower_edges (
            follower TEXT NOT NULL,
            followed TEXT NOT NULL,
            PRIMARY KEY (follower, followed)
        );
        CREATE INDEX IF NOT EXISTS cached_follower_edges_followed
            ON cached_follower_edges (followed);

        CREATE TABLE IF NOT EXISTS follower_trend_changes (
            day    TEXT NOT NULL,
            pubkey TEXT NOT NULL,
            gained INTEGER NOT NULL DEFAULT 0,
            lost   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (day, pubkey)
        );

        CREATE TABLE IF NOT EXISTS cached_most_muted (
            pubkey     TEXT PRIMARY KEY,
            mute_count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_top_interests (
            topic TEXT PRIMARY KEY,
            count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_relay_stats (
            url             TEXT PRIMARY KEY,
            reference_count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_social_counts (
            name  TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_event_counts (
            kind  INTEGER PRIMARY KEY,
            count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trusted_pubkeys (
            pubkey TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS community_nodes (
            id             INTEGER PRIMARY KEY,
            size           INTEGER NOT NULL,
            modularity     REAL NOT NULL,
            internal_edges INTEGER NOT NULL,
            external_edges INTEGER NOT NULL,
            top_members    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS community_edges (
            from_id INTEGER NOT NULL,
            to_id   INTEGER NOT NULL,
            weight  INTEGER NOT NULL,
            PRIMARY KEY (from_id, to_id)
        );
        "#,
    )?;
    Ok(())
}

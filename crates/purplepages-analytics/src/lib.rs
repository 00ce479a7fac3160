//! The analytics store: every derived table lives here.
//!
//! Everything in this database can be rebuilt from the event store; losing
//! it costs history (telemetry, trends) but never events. Multi-row cache
//! refreshes run inside a single transaction so readers never observe a
//! half-built cache.

mod cache_ops;
mod graph_ops;
mod models;
mod peer_ops;
mod rate_ops;
mod read_ops;
mod schema;
mod snapshot_ops;
mod telemetry_ops;

use std::path::PathBuf;
use std::result;
use std::sync::Mutex;

use purplepages_core::Timestamp;
use rusqlite::Connection;
use snafu::{Location, ResultExt as _, Snafu};
use tracing::debug;

pub use self::models::*;

const LOG_TARGET: &str = "purplepages::analytics";

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT_MILLIS: u64 = 5_000;

#[derive(Debug, Snafu)]
pub enum AnalyticsError {
    #[snafu(transparent)]
    Sqlite {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },
    Open {
        source: rusqlite::Error,
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type AnalyticsResult<T> = result::Result<T, AnalyticsError>;

/// Handle to the analytics database.
///
/// A single connection behind a mutex: many logical readers, one writer,
/// short transactions. SQLite's WAL journal handles crash consistency.
#[derive(Debug)]
pub struct AnalyticsDb {
    conn: Mutex<Connection>,
}

impl AnalyticsDb {
    pub async fn open(path: impl Into<PathBuf>) -> AnalyticsResult<AnalyticsDb> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening analytics database");

        let conn = tokio::task::spawn_blocking({
            let path = path.clone();
            move || Connection::open(&path)
        })
        .await
        .context(JoinSnafu)?
        .context(OpenSnafu { path })?;

        Self::open_inner(conn)
    }

    pub fn open_in_memory() -> AnalyticsResult<AnalyticsDb> {
        Self::open_inner(Connection::open_in_memory()?)
    }

    fn open_inner(conn: Connection) -> AnalyticsResult<AnalyticsDb> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MILLIS))?;

        schema::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure against the connection off the async executor.
    pub(crate) async fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> AnalyticsResult<T>,
    ) -> AnalyticsResult<T> {
        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().expect("Locking failed");
            f(&mut conn)
        })
    }
}

/// `YYYY-MM-DD` bucket a timestamp falls into, UTC.
pub fn day_string(ts: Timestamp) -> String {
    let date = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(ts.as_secs()).unwrap_or(i64::MAX),
    )
    .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
    .date();
    let format = time::macros::format_description!("[year]-[month]-[day]");
    date.format(&format).expect("Can't fail: fixed format")
}

/// Canonical key for an unordered pubkey pair, `min:max`, so both
/// orientations of a pair collide on one row.
pub fn pair_key(a: &purplepages_core::Pubkey, b: &purplepages_core::Pubkey) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

/// Decode a hex pubkey column, mapping parse failures into the sqlite
/// conversion error so they surface through the usual row plumbing.
pub(crate) fn parse_pubkey(s: String) -> rusqlite::Result<purplepages_core::Pubkey> {
    s.parse().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })
}

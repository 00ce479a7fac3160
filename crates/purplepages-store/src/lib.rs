mod hll;
mod query_ops;
mod save_ops;
mod scan;
mod tables;

use std::ops;
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;
use std::time::Instant;

use purplepages_core::{Event, EventId, Filter, Kind, Pubkey, Timestamp};
use redb_bincode::{ReadTransaction, WriteTransaction};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::{debug, warn};

pub use self::hll::HllSketch;
pub use self::save_ops::SaveOutcome;
pub use self::scan::{ScanPages, DEFAULT_SCAN_PAGE};
pub use self::tables::*;

const LOG_TARGET: &str = "purplepages::store";

/// Single-event save latency above which a warning is logged.
const SLOW_SAVE_MILLIS: u128 = 100;

#[derive(Debug, Snafu)]
pub enum StoreError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Query exceeded the read timeout"))]
    QueryTimeout {
        #[snafu(implicit)]
        location: Location,
    },
}
pub type StoreResult<T> = result::Result<T, StoreError>;

/// A write transaction that can carry post-commit hooks.
///
/// Observers (peer discovery, live dispatch) must only see committed data,
/// so notifications are queued on the transaction and fired after commit.
pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

/// The content-addressed event store.
///
/// The source of truth for accepted events; every other store in the system
/// is derived from it and may be rebuilt from it.
#[derive(Debug)]
pub struct EventStore {
    inner: redb_bincode::Database,
    path: Option<PathBuf>,
    archive_enabled: bool,
    saved_tx: broadcast::Sender<Event>,
}

impl EventStore {
    pub async fn open(
        path: impl Into<PathBuf>,
        archive_enabled: bool,
    ) -> StoreResult<EventStore> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening event store");

        let inner = tokio::task::spawn_blocking({
            let path = path.clone();
            move || redb::Database::create(path)
        })
        .await
        .context(JoinSnafu)?
        .context(DatabaseSnafu)?;

        Self::open_inner(inner, Some(path), archive_enabled).await
    }

    pub async fn new_in_memory(archive_enabled: bool) -> StoreResult<EventStore> {
        debug!(target: LOG_TARGET, "Opening in-memory event store");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner, None, archive_enabled).await
    }

    async fn open_inner(
        inner: redb::Database,
        path: Option<PathBuf>,
        archive_enabled: bool,
    ) -> StoreResult<EventStore> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Ok(())
        })
        .await?;

        let (saved_tx, _) = broadcast::channel(1024);

        Ok(Self {
            inner,
            path,
            archive_enabled,
            saved_tx,
        })
    }

    fn init_tables_tx(tx: &WriteTransactionCtx) -> StoreResult<()> {
        tx.open_table(&db_version::TABLE)?;
        tx.open_table(&events::TABLE)?;
        tx.open_table(&events_by_time::TABLE)?;
        tx.open_table(&events_by_author_kind::TABLE)?;
        tx.open_table(&events_by_kind::TABLE)?;
        tx.open_table(&events_by_tag::TABLE)?;
        tx.open_table(&event_history::TABLE)?;

        let mut db_version_tbl = tx.open_table(&db_version::TABLE)?;
        if db_version_tbl.get(&())?.is_none() {
            db_version_tbl.insert(&(), &0u64)?;
        }
        Ok(())
    }

    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> StoreResult<T>,
    ) -> StoreResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = self.inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    /// Notified with every newly saved event, post-commit.
    pub fn subscribe_saved(&self) -> broadcast::Receiver<Event> {
        self.saved_tx.subscribe()
    }

    /// Persist an event, applying the replacement policy for its kind.
    pub async fn save(&self, event: &Event) -> StoreResult<SaveOutcome> {
        let started = Instant::now();
        let outcome = self
            .write_with(|tx| self.save_tx(event, Timestamp::now(), tx))
            .await?;

        let elapsed = started.elapsed().as_millis();
        if SLOW_SAVE_MILLIS < elapsed {
            warn!(
                target: LOG_TARGET,
                event_id = %event.id,
                elapsed_ms = %elapsed,
                "Slow event save"
            );
        }

        Ok(outcome)
    }

    pub async fn get_event(&self, event_id: EventId) -> StoreResult<Option<Event>> {
        self.read_with(|tx| {
            let events_tbl = tx.open_table(&events::TABLE)?;
            Ok(Self::get_event_tx(event_id, &events_tbl)?.map(|record| record.event))
        })
        .await
    }

    pub async fn has_event(&self, event_id: EventId) -> StoreResult<bool> {
        self.read_with(|tx| {
            let events_tbl = tx.open_table(&events::TABLE)?;
            let exists = events_tbl.get(&event_id)?.is_some();
            Ok(exists)
        })
        .await
    }

    /// Newest stored event for `(author, kind)`.
    ///
    /// For replaceable kinds this is the single stored instance.
    pub async fn latest_by_author_kind(
        &self,
        author: Pubkey,
        kind: Kind,
    ) -> StoreResult<Option<Event>> {
        self.read_with(|tx| Self::latest_by_author_kind_tx(tx, author, kind)).await
    }

    /// One-shot filtered query, newest-first.
    ///
    /// Used for bounded reads; unbounded consumers should use
    /// [`EventStore::scan`] or [`EventStore::stream`] instead.
    pub async fn query(&self, filter: &Filter) -> StoreResult<Vec<Event>> {
        self.read_with(|tx| Self::query_tx(tx, filter, usize::MAX)).await
    }

    pub async fn delete(&self, event_id: EventId) -> StoreResult<bool> {
        self.write_with(|tx| Self::delete_tx(event_id, tx)).await
    }

    pub async fn delete_by_author(&self, author: Pubkey) -> StoreResult<u64> {
        self.write_with(|tx| Self::delete_by_author_tx(author, tx)).await
    }

    /// Size of the backing file, for storage snapshots.
    ///
    /// In-memory stores report zero.
    pub fn storage_bytes(&self) -> u64 {
        self.path
            .as_deref()
            .and_then(|path: &Path| std::fs::metadata(path).ok())
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    /// Total number of stored events.
    pub async fn event_count(&self) -> StoreResult<u64> {
        self.read_with(|tx| {
            let events_by_time_tbl = tx.open_table(&events_by_time::TABLE)?;
            let mut count = 0u64;
            for entry in events_by_time_tbl.range(..)? {
                entry?;
                count += 1;
            }
            Ok(count)
        })
        .await
    }

    pub fn archive_enabled(&self) -> bool {
        self.archive_enabled
    }

    /// Bounded, pull-driven stream of query results, newest-first.
    ///
    /// Dropping the receiver cancels the producer at the next page boundary;
    /// everything already yielded stays valid.
    pub fn stream(
        self: &Arc<Self>,
        filter: Filter,
        page_size: usize,
    ) -> tokio::sync::mpsc::Receiver<Event> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            let mut pages = ScanPages::new(&this, filter, page_size);
            loop {
                let batch = match pages.next_batch().await {
                    Ok(Some(batch)) => batch,
                    Ok(None) => break,
                    Err(err) => {
                        use purplepages_util::FmtCompact as _;
                        warn!(
                            target: LOG_TARGET,
                            err = %err.fmt_compact(),
                            "Query stream failed"
                        );
                        break;
                    }
                };
                for event in batch {
                    if tx.send(event).await.is_err() {
                        // consumer gone; nothing left to do
                        return;
                    }
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use purplepages_analytics::AnalyticsDb;
use purplepages_core::{Filter, Kind, KindSet, Pubkey, Timestamp};
use purplepages_store::EventStore;
use purplepages_util::{FmtCompact as _, ShutdownToken};
use tracing::{debug, info, warn};

use crate::connector::{RelayConnector, SubItem};
use crate::{normalize_relay_url, TrustedWatch};

const LOG_TARGET: &str = "purplepages::sync::trusted";

/// Drain timeout for one author-on-one-relay subscription.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TrustedSyncerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub relay_timeout: Duration,
    pub kinds: KindSet,
    /// Only service authors still missing a profile or contact list
    /// (the profile-hydration variant).
    pub missing_only: bool,
}

impl Default for TrustedSyncerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            batch_size: 50,
            relay_timeout: Duration::from_secs(10),
            kinds: KindSet::default_sync(),
            missing_only: false,
        }
    }
}

/// Pulls each trusted author's events from that author's own advertised
/// write relays, resuming from a per-author `since` bookmark.
pub struct TrustedSyncer {
    store: Arc<EventStore>,
    analytics: Arc<AnalyticsDb>,
    connector: Arc<dyn RelayConnector>,
    trusted: TrustedWatch,
    config: TrustedSyncerConfig,
    shutdown: ShutdownToken,
}

impl TrustedSyncer {
    pub fn new(
        store: Arc<EventStore>,
        analytics: Arc<AnalyticsDb>,
        connector: Arc<dyn RelayConnector>,
        trusted: TrustedWatch,
        config: TrustedSyncerConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            analytics,
            connector,
            trusted,
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            target: LOG_TARGET,
            interval_secs = self.config.interval.as_secs(),
            batch = self.config.batch_size,
            missing_only = self.config.missing_only,
            "Starting trusted syncer"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(err) = self.run_once().await {
                        warn!(
                            target: LOG_TARGET,
                            err = %err.fmt_compact(),
                            "Trusted sync cycle failed"
                        );
                    }
                }
            }
        }
        debug!(target: LOG_TARGET, "Trusted syncer stopped");
    }

    /// One full cycle: select a batch of trusted authors and pull each one.
    pub async fn run_once(&mut self) -> purplepages_util::BoxedErrorResult<()> {
        let trusted: Arc<HashSet<Pubkey>> = self.trusted.borrow().clone();
        if trusted.is_empty() {
            debug!(target: LOG_TARGET, "Trusted set empty; nothing to sync");
            return Ok(());
        }

        let last_synced = self.analytics.last_synced_all().await?;

        // authors still missing a profile or contact list come first
        let mut missing: Vec<Pubkey> = Vec::new();
        let mut rest: Vec<Pubkey> = Vec::new();
        for pubkey in trusted.iter().copied() {
            let has_profile = self
                .store
                .latest_by_author_kind(pubkey, Kind::PROFILE)
                .await?
                .is_some();
            let has_contacts = self
                .store
                .latest_by_author_kind(pubkey, Kind::CONTACTS)
                .await?
                .is_some();
            if has_profile && has_contacts {
                rest.push(pubkey);
            } else {
                missing.push(pubkey);
            }
        }
        missing.sort();
        rest.sort_by_key(|pubkey| {
            (
                last_synced.get(pubkey).copied().unwrap_or(Timestamp::ZERO),
                *pubkey,
            )
        });

        let mut batch: Vec<Pubkey> = missing;
        batch.truncate(self.config.batch_size);
        if !self.config.missing_only {
            let capacity = self.config.batch_size.saturating_sub(batch.len());
            batch.extend(rest.into_iter().take(capacity));
        }

        debug!(target: LOG_TARGET, batch = batch.len(), "Trusted sync batch selected");
        for pubkey in batch {
            if self.shutdown.is_shutdown() {
                break;
            }
            let since = last_synced.get(&pubkey).copied();
            self.sync_author(pubkey, since).await?;
        }
        Ok(())
    }

    /// Pull one author from their advertised write relays, then bump the
    /// bookmark unconditionally.
    async fn sync_author(
        &self,
        pubkey: Pubkey,
        since: Option<Timestamp>,
    ) -> purplepages_util::BoxedErrorResult<()> {
        let relay_list = self
            .store
            .latest_by_author_kind(pubkey, Kind::RELAY_LIST)
            .await?;

        if let Some(relay_list) = relay_list {
            let mut write_relays: Vec<String> = Vec::new();
            for tag in &relay_list.tags {
                if tag.name() != Some("r") {
                    continue;
                }
                // NIP-65 marker: "read" relays are where the author reads,
                // not where they publish
                if tag.marker() == Some("read") {
                    continue;
                }
                let Some(url) = tag.value() else { continue };
                match normalize_relay_url(url) {
                    Ok(normalized) => {
                        if !write_relays.contains(&normalized) {
                            write_relays.push(normalized);
                        }
                    }
                    Err(err) => {
                        debug!(target: LOG_TARGET, url, err = %err, "Skipping relay URL");
                    }
                }
            }

            for relay in &write_relays {
                if let Err(err) = self.sync_author_on_relay(pubkey, relay, since).await {
                    warn!(
                        target: LOG_TARGET,
                        author = %pubkey,
                        relay = %relay,
                        err = %err.fmt_compact(),
                        "Author sync failed on relay"
                    );
                }
            }
        } else {
            debug!(target: LOG_TARGET, author = %pubkey, "No relay list; nothing to pull");
        }

        self.analytics
            .set_last_synced(pubkey, Timestamp::now())
            .await?;
        Ok(())
    }

    async fn sync_author_on_relay(
        &self,
        pubkey: Pubkey,
        relay: &str,
        since: Option<Timestamp>,
    ) -> purplepages_util::BoxedErrorResult<()> {
        debug!(
            target: LOG_TARGET,
            author = %pubkey,
            relay = %relay,
            since = %since.unwrap_or(Timestamp::ZERO),
            "Pulling author from write relay"
        );
        let mut session = self
            .connector
            .connect(relay, self.config.relay_timeout)
            .await?;

        let filter = Filter {
            authors: Some([pubkey].into()),
            kinds: Some(self.config.kinds.iter().collect()),
            since: Some(since.unwrap_or(Timestamp::ZERO)),
            ..Default::default()
        };
        session.subscribe(std::slice::from_ref(&filter)).await?;

        let mut hits = 0u64;
        loop {
            let item = tokio::time::timeout(IDLE_TIMEOUT, session.recv()).await;
            match item {
                Err(_elapsed) => break,
                Ok(Ok(Some(SubItem::Event(event)))) => {
                    if self.store.save(&event).await?.is_saved() {
                        hits += 1;
                    }
                }
                Ok(Ok(Some(SubItem::Eose))) => break,
                Ok(Ok(Some(SubItem::Closed(_)))) | Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    session.close().await;
                    return Err(err.into());
                }
            }
        }
        session.close().await;

        self.analytics
            .record_peer_author_stats(relay, pubkey, hits, Timestamp::now())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use purplepages_core::{Event, EventId, Sig, Tag};
    use purplepages_util::{BoxedErrorResult, ShutdownController};
    use tokio::sync::watch;

    use super::*;
    use crate::testing::MemoryConnector;

    fn pk(n: u8) -> Pubkey {
        Pubkey::from_bytes([n; 32])
    }

    fn event(id_byte: u8, author: Pubkey, created_at: u64, kind: Kind, tags: Vec<Tag>) -> Event {
        Event {
            id: EventId::from_bytes([id_byte; 32]),
            pubkey: author,
            created_at: Timestamp::from_secs(created_at),
            kind,
            tags,
            content: String::new(),
            sig: Sig::ZERO,
        }
    }

    fn syncer(
        store: &Arc<EventStore>,
        analytics: &Arc<AnalyticsDb>,
        connector: &Arc<MemoryConnector>,
        trusted: &[Pubkey],
    ) -> (
        TrustedSyncer,
        ShutdownController,
        watch::Sender<Arc<HashSet<Pubkey>>>,
    ) {
        let (controller, shutdown) = ShutdownController::new();
        let (trusted_tx, trusted_rx) =
            watch::channel(Arc::new(trusted.iter().copied().collect::<HashSet<_>>()));
        (
            TrustedSyncer::new(
                store.clone(),
                analytics.clone(),
                connector.clone(),
                trusted_rx,
                TrustedSyncerConfig {
                    relay_timeout: Duration::from_secs(1),
                    ..Default::default()
                },
                shutdown,
            ),
            controller,
            trusted_tx,
        )
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn pulls_from_write_relays_only() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let connector = Arc::new(MemoryConnector::new());
        let alice = pk(1);

        store
            .save(&event(
                10,
                alice,
                100,
                Kind::RELAY_LIST,
                vec![
                    Tag::new(["r", "wss://write.example.com"]),
                    Tag::new(["r", "wss://read.example.com", "read"]),
                ],
            ))
            .await?;

        let write_relay = connector.relay("wss://write.example.com");
        write_relay.seed([
            event(20, alice, 200, Kind::PROFILE, vec![]),
            event(21, alice, 201, Kind::CONTACTS, vec![]),
        ]);
        let read_relay = connector.relay("wss://read.example.com");

        let (mut syncer, _controller, _trusted_tx) = syncer(&store, &analytics, &connector, &[alice]);
        syncer.run_once().await?;

        assert!(store.latest_by_author_kind(alice, Kind::PROFILE).await?.is_some());
        assert!(store.latest_by_author_kind(alice, Kind::CONTACTS).await?.is_some());
        assert_eq!(read_relay.connect_count(), 0);
        assert!(analytics.get_last_synced(alice).await?.is_some());
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn author_without_relay_list_is_bookmarked() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let connector = Arc::new(MemoryConnector::new());
        let bob = pk(2);

        let (mut syncer, _controller, _trusted_tx) = syncer(&store, &analytics, &connector, &[bob]);
        syncer.run_once().await?;

        assert!(analytics.get_last_synced(bob).await?.is_some());
        assert_eq!(store.event_count().await?, 0);
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn since_bookmark_skips_old_events() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let connector = Arc::new(MemoryConnector::new());
        let alice = pk(1);

        store
            .save(&event(
                10,
                alice,
                100,
                Kind::RELAY_LIST,
                vec![Tag::new(["r", "wss://write.example.com"])],
            ))
            .await?;
        // make the author "complete" so the bookmark ordering path runs
        store.save(&event(11, alice, 100, Kind::PROFILE, vec![])).await?;
        store.save(&event(12, alice, 100, Kind::CONTACTS, vec![])).await?;

        let relay = connector.relay("wss://write.example.com");
        relay.seed([
            event(20, alice, 400, Kind::PROFILE, vec![]),
            event(21, alice, 600, Kind::PROFILE, vec![]),
        ]);

        analytics.set_last_synced(alice, Timestamp::from_secs(500)).await?;

        let (mut syncer, _controller, _trusted_tx) = syncer(&store, &analytics, &connector, &[alice]);
        syncer.run_once().await?;

        // only the post-bookmark profile came over (and replaced the stub)
        let profile = store
            .latest_by_author_kind(alice, Kind::PROFILE)
            .await?
            .expect("profile exists");
        assert_eq!(profile.created_at, Timestamp::from_secs(600));
        Ok(())
    }
}

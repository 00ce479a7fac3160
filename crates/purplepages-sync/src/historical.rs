use std::sync::Arc;
use std::time::Duration;

use purplepages_core::{Filter, Kind, KindSet, Timestamp};
use purplepages_store::EventStore;
use purplepages_util::{FmtCompact as _, ShutdownToken};
use tracing::{debug, info, warn};

use crate::connector::{ConnectorResult, RelayConnector, RelaySession, SubItem};

const LOG_TARGET: &str = "purplepages::sync::historical";

/// Page size for backward catch-up; a short page means the peer is drained.
pub const PAGE_LIMIT: usize = 500;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// A page concludes when the peer goes quiet this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Startup catch-up: pages backward through each configured peer for each
/// allowed kind until exhausted.
///
/// Failures are per-relay and per-kind: one bad peer never stops the rest.
pub struct HistoricalSyncer {
    store: Arc<EventStore>,
    connector: Arc<dyn RelayConnector>,
    relays: Vec<String>,
    kinds: KindSet,
    shutdown: ShutdownToken,
}

impl HistoricalSyncer {
    pub fn new(
        store: Arc<EventStore>,
        connector: Arc<dyn RelayConnector>,
        relays: Vec<String>,
        kinds: KindSet,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            connector,
            relays,
            kinds,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            target: LOG_TARGET,
            relays = self.relays.len(),
            kinds = %self.kinds,
            "Starting historical sync"
        );
        let relays = std::mem::take(&mut self.relays);
        for relay in &relays {
            if self.shutdown.is_shutdown() {
                break;
            }
            match self.sync_relay(relay).await {
                Ok(fetched) => {
                    info!(target: LOG_TARGET, relay = %relay, fetched, "Relay caught up");
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        relay = %relay,
                        err = %err.fmt_compact(),
                        "Historical sync failed; moving on"
                    );
                }
            }
        }
        info!(target: LOG_TARGET, "Historical sync complete");
    }

    async fn sync_relay(&mut self, url: &str) -> ConnectorResult<u64> {
        let mut session = self.connector.connect(url, CONNECT_TIMEOUT).await?;

        let mut fetched = 0;
        let kinds = self.kinds.clone();
        for kind in kinds {
            if self.shutdown.is_shutdown() {
                break;
            }
            match self.sync_kind(session.as_mut(), kind).await {
                Ok(count) => fetched += count,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        relay = %url,
                        kind = %kind,
                        err = %err.fmt_compact(),
                        "Kind sync failed; next kind"
                    );
                }
            }
        }

        session.close().await;
        Ok(fetched)
    }

    /// Page backward with `until` cursors until a page comes back short.
    async fn sync_kind(
        &mut self,
        session: &mut dyn RelaySession,
        kind: Kind,
    ) -> ConnectorResult<u64> {
        let mut cursor: Option<Timestamp> = None;
        let mut fetched = 0u64;

        loop {
            let filter = Filter {
                kinds: Some([kind].into()),
                limit: Some(PAGE_LIMIT),
                until: cursor,
                ..Default::default()
            };
            session.subscribe(std::slice::from_ref(&filter)).await?;

            let mut received = 0usize;
            let mut oldest: Option<Timestamp> = None;
            loop {
                let item = tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        session.unsubscribe().await;
                        return Ok(fetched);
                    }
                    item = tokio::time::timeout(IDLE_TIMEOUT, session.recv()) => item,
                };
                match item {
                    // idle timer fired: conclude the page
                    Err(_elapsed) => break,
                    Ok(Ok(Some(SubItem::Event(event)))) => {
                        received += 1;
                        oldest = Some(match oldest {
                            Some(oldest) => oldest.min(event.created_at),
                            None => event.created_at,
                        });
                        match self.store.save(&event).await {
                            Ok(outcome) => {
                                if outcome.is_saved() {
                                    fetched += 1;
                                }
                            }
                            Err(err) => {
                                warn!(
                                    target: LOG_TARGET,
                                    event_id = %event.id,
                                    err = %err.fmt_compact(),
                                    "Failed to save synced event"
                                );
                            }
                        }
                    }
                    Ok(Ok(Some(SubItem::Eose))) => break,
                    Ok(Ok(Some(SubItem::Closed(reason)))) => {
                        debug!(target: LOG_TARGET, kind = %kind, reason, "Subscription closed by peer");
                        break;
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(err)) => {
                        session.unsubscribe().await;
                        return Err(err);
                    }
                }
            }
            session.unsubscribe().await;

            if received < PAGE_LIMIT {
                break;
            }
            let Some(oldest) = oldest else {
                break;
            };
            cursor = Some(oldest.saturating_sub(1));
        }

        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use purplepages_core::{Event, EventId, Pubkey, Sig};
    use purplepages_util::{BoxedErrorResult, ShutdownController};

    use super::*;
    use crate::testing::MemoryConnector;

    fn contact_list(n: u64, created_at: u64) -> Event {
        let mut id = [0u8; 32];
        id[24..].copy_from_slice(&n.to_be_bytes());
        let mut pubkey = [0u8; 32];
        pubkey[24..].copy_from_slice(&n.to_be_bytes());
        Event {
            id: EventId::from_bytes(id),
            pubkey: Pubkey::from_bytes(pubkey),
            created_at: Timestamp::from_secs(created_at),
            kind: Kind::CONTACTS,
            tags: vec![],
            content: String::new(),
            sig: Sig::ZERO,
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn pages_until_short_page() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let connector = Arc::new(MemoryConnector::new());
        let relay = connector.relay("wss://peer.example.com");
        // 1200 events: page 1 (500), page 2 (500), page 3 (200) terminates
        relay.seed((0..1200u64).map(|n| contact_list(n, 10_000 + n)));

        let (_controller, shutdown) = ShutdownController::new();
        let syncer = HistoricalSyncer::new(
            store.clone(),
            connector.clone(),
            vec!["wss://peer.example.com".to_owned()],
            [Kind::CONTACTS].into_iter().collect(),
            shutdown,
        );
        syncer.run().await;

        assert_eq!(store.event_count().await?, 1200);
        assert_eq!(relay.subscribe_count(), 3);
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn single_second_backlog_terminates() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let connector = Arc::new(MemoryConnector::new());
        let relay = connector.relay("wss://peer.example.com");
        // every event in one second: the `oldest - 1` cursor steps past the
        // second after the first full page, so paging terminates instead of
        // spinning on the same page forever
        relay.seed((0..700u64).map(|n| contact_list(n, 5_000)));

        let (_controller, shutdown) = ShutdownController::new();
        let syncer = HistoricalSyncer::new(
            store.clone(),
            connector.clone(),
            vec!["wss://peer.example.com".to_owned()],
            [Kind::CONTACTS].into_iter().collect(),
            shutdown,
        );
        syncer.run().await;

        assert_eq!(store.event_count().await?, 500);
        assert_eq!(relay.subscribe_count(), 2);
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn bad_relay_does_not_stop_the_rest() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let connector = Arc::new(MemoryConnector::new());
        let good = connector.relay("wss://good.example.com");
        good.seed([contact_list(1, 100)]);

        let (_controller, shutdown) = ShutdownController::new();
        let syncer = HistoricalSyncer::new(
            store.clone(),
            connector.clone(),
            vec![
                // not registered with the connector: connect fails
                "wss://missing.example.com".to_owned(),
                "wss://good.example.com".to_owned(),
            ],
            [Kind::CONTACTS].into_iter().collect(),
            shutdown,
        );
        syncer.run().await;

        assert_eq!(store.event_count().await?, 1);
        Ok(())
    }
}

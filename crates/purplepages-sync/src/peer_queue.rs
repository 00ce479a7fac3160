use std::sync::Arc;
use std::time::Duration;

use purplepages_analytics::AnalyticsDb;
use purplepages_core::{Filter, Kind, KindSet, Timestamp};
use purplepages_store::EventStore;
use purplepages_util::{FmtCompact as _, ShutdownToken};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connector::{ConnectorResult, RelayConnector, RelaySession, SubItem};

const LOG_TARGET: &str = "purplepages::sync::peer_queue";

/// Default rotation cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Short refresh subscriptions give up quickly on quiet peers.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_LIMIT: usize = 500;

/// Round-robin re-sync of discovered peers.
///
/// Every tick picks the active peer that went longest without a sync and
/// refreshes each allowed kind with a short subscription. Newly discovered
/// peers (from the discovery channel) jump the rotation for their first
/// sync.
pub struct PeerQueueWorker {
    store: Arc<EventStore>,
    analytics: Arc<AnalyticsDb>,
    connector: Arc<dyn RelayConnector>,
    kinds: KindSet,
    discovered_rx: mpsc::Receiver<String>,
    tick: Duration,
    shutdown: ShutdownToken,
}

impl PeerQueueWorker {
    pub fn new(
        store: Arc<EventStore>,
        analytics: Arc<AnalyticsDb>,
        connector: Arc<dyn RelayConnector>,
        kinds: KindSet,
        discovered_rx: mpsc::Receiver<String>,
        tick: Duration,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            store,
            analytics,
            connector,
            kinds,
            discovered_rx,
            tick,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(target: LOG_TARGET, "Starting peer queue worker");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.analytics.active_relays_oldest_first(1).await {
                        Ok(peers) => {
                            if let Some(peer) = peers.first() {
                                self.sync_peer(&peer.url).await;
                            }
                        }
                        Err(err) => {
                            warn!(
                                target: LOG_TARGET,
                                err = %err.fmt_compact(),
                                "Failed to read peer queue"
                            );
                        }
                    }
                }
                // a closed discovery channel just disables this arm
                Some(url) = self.discovered_rx.recv() => {
                    self.sync_peer(&url).await;
                }
            }
        }
        debug!(target: LOG_TARGET, "Peer queue worker stopped");
    }

    /// One sync cycle against one peer: one attempt, success iff every
    /// kind-sync finished without error.
    async fn sync_peer(&self, url: &str) {
        let mut contributed = 0u64;
        let mut ok = true;

        match self.connector.connect(url, CONNECT_TIMEOUT).await {
            Ok(mut session) => {
                for kind in self.kinds.iter() {
                    if self.shutdown.is_shutdown() {
                        break;
                    }
                    match self.sync_kind(session.as_mut(), kind).await {
                        Ok(new_events) => contributed += new_events,
                        Err(err) => {
                            ok = false;
                            warn!(
                                target: LOG_TARGET,
                                peer = %url,
                                kind = %kind,
                                err = %err.fmt_compact(),
                                "Peer kind refresh failed"
                            );
                        }
                    }
                }
                session.close().await;
            }
            Err(err) => {
                ok = false;
                warn!(
                    target: LOG_TARGET,
                    peer = %url,
                    err = %err.fmt_compact(),
                    "Peer connect failed"
                );
            }
        }

        if let Err(err) = self
            .analytics
            .record_relay_sync(url, ok, contributed, Timestamp::now())
            .await
        {
            warn!(
                target: LOG_TARGET,
                peer = %url,
                err = %err.fmt_compact(),
                "Failed to record peer sync"
            );
        } else {
            debug!(target: LOG_TARGET, peer = %url, ok, contributed, "Peer sync recorded");
        }
    }

    async fn sync_kind(
        &self,
        session: &mut dyn RelaySession,
        kind: Kind,
    ) -> ConnectorResult<u64> {
        let filter = Filter {
            kinds: Some([kind].into()),
            limit: Some(PAGE_LIMIT),
            ..Default::default()
        };
        session.subscribe(std::slice::from_ref(&filter)).await?;

        let mut new_events = 0u64;
        loop {
            let item = tokio::time::timeout(IDLE_TIMEOUT, session.recv()).await;
            match item {
                Err(_elapsed) => break,
                Ok(Ok(Some(SubItem::Event(event)))) => {
                    match self.store.save(&event).await {
                        Ok(outcome) => {
                            if outcome.is_saved() {
                                new_events += 1;
                            }
                        }
                        Err(err) => {
                            warn!(
                                target: LOG_TARGET,
                                event_id = %event.id,
                                err = %err.fmt_compact(),
                                "Failed to save peer event"
                            );
                        }
                    }
                }
                Ok(Ok(Some(SubItem::Eose))) => break,
                Ok(Ok(Some(SubItem::Closed(_)))) | Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    session.unsubscribe().await;
                    return Err(err);
                }
            }
        }
        session.unsubscribe().await;
        Ok(new_events)
    }
}

#[cfg(test)]
mod tests {
    use purplepages_core::{Event, EventId, Pubkey, Sig};
    use purplepages_util::{BoxedErrorResult, ShutdownController};

    use super::*;
    use crate::testing::MemoryConnector;

    fn profile(n: u8, created_at: u64) -> Event {
        Event {
            id: EventId::from_bytes([n; 32]),
            pubkey: Pubkey::from_bytes([n; 32]),
            created_at: Timestamp::from_secs(created_at),
            kind: Kind::PROFILE,
            tags: vec![],
            content: String::new(),
            sig: Sig::ZERO,
        }
    }

    async fn wait_for<F, Fut>(mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if probe().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn discovered_peer_gets_immediate_sync() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let connector = Arc::new(MemoryConnector::new());
        let relay = connector.relay("wss://new.example.com");
        relay.seed([profile(1, 100), profile(2, 101)]);
        analytics
            .upsert_discovered_relay("wss://new.example.com", Timestamp::from_secs(1))
            .await?;

        let (discovered_tx, discovered_rx) = mpsc::channel(8);
        let (controller, shutdown) = ShutdownController::new();
        let worker = PeerQueueWorker::new(
            store.clone(),
            analytics.clone(),
            connector.clone(),
            [Kind::PROFILE].into_iter().collect(),
            discovered_rx,
            Duration::from_secs(3600),
            shutdown,
        );
        let handle = tokio::spawn(worker.run());

        discovered_tx.send("wss://new.example.com".to_owned()).await?;

        assert!(
            wait_for(|| {
                let store = store.clone();
                async move { store.event_count().await.unwrap_or(0) == 2 }
            })
            .await
        );

        // stats: one attempt, one success, two contributed
        let peers = analytics.list_relays(10).await?;
        assert_eq!(peers[0].attempts, 1);
        assert_eq!(peers[0].successes, 1);
        assert_eq!(peers[0].events_contributed, 2);
        assert!(peers[0].last_sync_at.is_some());

        controller.shutdown();
        handle.await?;
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn tick_picks_least_recently_synced_peer() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let connector = Arc::new(MemoryConnector::new());
        let stale = connector.relay("wss://stale.example.com");
        let fresh = connector.relay("wss://fresh.example.com");

        analytics
            .upsert_discovered_relay("wss://stale.example.com", Timestamp::from_secs(1))
            .await?;
        analytics
            .upsert_discovered_relay("wss://fresh.example.com", Timestamp::from_secs(1))
            .await?;
        analytics
            .record_relay_sync("wss://stale.example.com", true, 0, Timestamp::from_secs(100))
            .await?;
        analytics
            .record_relay_sync(
                "wss://fresh.example.com",
                true,
                0,
                Timestamp::from_secs(2_000_000_000),
            )
            .await?;

        let (_discovered_tx, discovered_rx) = mpsc::channel(8);
        let (controller, shutdown) = ShutdownController::new();
        let worker = PeerQueueWorker::new(
            store,
            analytics.clone(),
            connector.clone(),
            [Kind::PROFILE].into_iter().collect(),
            discovered_rx,
            Duration::from_millis(50),
            shutdown,
        );
        let handle = tokio::spawn(worker.run());

        assert!(
            wait_for(|| {
                let stale = stale.clone();
                async move { 0 < stale.connect_count() }
            })
            .await
        );
        // the recently-synced peer keeps waiting its turn
        assert_eq!(fresh.connect_count(), 0);

        controller.shutdown();
        handle.await?;
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn failed_connect_counts_attempt_without_success() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let connector = Arc::new(MemoryConnector::new());
        let relay = connector.relay("wss://flaky.example.com");
        relay.fail_next_connects(1);
        analytics
            .upsert_discovered_relay("wss://flaky.example.com", Timestamp::from_secs(1))
            .await?;

        let (discovered_tx, discovered_rx) = mpsc::channel(8);
        let (controller, shutdown) = ShutdownController::new();
        let worker = PeerQueueWorker::new(
            store,
            analytics.clone(),
            connector.clone(),
            [Kind::PROFILE].into_iter().collect(),
            discovered_rx,
            Duration::from_secs(3600),
            shutdown,
        );
        let handle = tokio::spawn(worker.run());

        discovered_tx.send("wss://flaky.example.com".to_owned()).await?;

        assert!(
            wait_for(|| {
                let analytics = analytics.clone();
                async move {
                    analytics
                        .list_relays(10)
                        .await
                        .map(|peers| peers[0].attempts == 1)
                        .unwrap_or(false)
                }
            })
            .await
        );
        let peers = analytics.list_relays(10).await?;
        assert_eq!(peers[0].successes, 0);
        assert_eq!(peers[0].events_contributed, 0);

        controller.shutdown();
        handle.await?;
        Ok(())
    }
}

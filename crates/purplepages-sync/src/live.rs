use std::sync::Arc;
use std::time::Duration;

use purplepages_core::{Filter, KindSet, Timestamp};
use purplepages_store::EventStore;
use purplepages_util::{FmtCompact as _, ShutdownToken};
use tracing::{debug, info, warn};

use crate::connector::{RelayConnector, SubItem};

const LOG_TARGET: &str = "purplepages::sync::live";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Backoff between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Maintains a persistent `since = now` subscription per configured relay,
/// reconnecting forever until shutdown.
pub struct LiveSubscriber {
    store: Arc<EventStore>,
    connector: Arc<dyn RelayConnector>,
    relays: Vec<String>,
    kinds: KindSet,
    shutdown: ShutdownToken,
}

impl LiveSubscriber {
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

    /// One task per relay; returns once every relay loop has exited.
    pub async fn run(self) {
        info!(
            target: LOG_TARGET,
            relays = self.relays.len(),
            "Starting live subscriptions"
        );
        let mut handles = Vec::new();
        for relay in self.relays {
            handles.push(tokio::spawn(relay_loop(
                self.store.clone(),
                self.connector.clone(),
                relay,
                self.kinds.clone(),
                self.shutdown.clone(),
            )));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!(target: LOG_TARGET, "Live subscriptions stopped");
    }
}

async fn relay_loop(
    store: Arc<EventStore>,
    connector: Arc<dyn RelayConnector>,
    url: String,
    kinds: KindSet,
    mut shutdown: ShutdownToken,
) {
    loop {
        if shutdown.is_shutdown() {
            return;
        }

        match connector.connect(&url, CONNECT_TIMEOUT).await {
            Ok(mut session) => {
                let filter = Filter {
                    kinds: Some(kinds.iter().collect()),
                    since: Some(Timestamp::now()),
                    ..Default::default()
                };
                match session.subscribe(std::slice::from_ref(&filter)).await {
                    Ok(()) => {
                        debug!(target: LOG_TARGET, relay = %url, "Live subscription open");
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    session.close().await;
                                    return;
                                }
                                item = session.recv() => match item {
                                    Ok(Some(SubItem::Event(event))) => {
                                        if let Err(err) = store.save(&event).await {
                                            warn!(
                                                target: LOG_TARGET,
                                                relay = %url,
                                                event_id = %event.id,
                                                err = %err.fmt_compact(),
                                                "Failed to save live event"
                                            );
                                        }
                                    }
                                    Ok(Some(SubItem::Eose)) => {
                                        // live subscription: just a marker
                                    }
                                    Ok(Some(SubItem::Closed(reason))) => {
                                        debug!(target: LOG_TARGET, relay = %url, reason, "Subscription closed");
                                        break;
                                    }
                                    Ok(None) => break,
                                    Err(err) => {
                                        warn!(
                                            target: LOG_TARGET,
                                            relay = %url,
                                            err = %err.fmt_compact(),
                                            "Live receive failed"
                                        );
                                        break;
                                    }
                                },
                            }
                        }
                        session.close().await;
                    }
                    Err(err) => {
                        warn!(
                            target: LOG_TARGET,
                            relay = %url,
                            err = %err.fmt_compact(),
                            "Live subscribe failed"
                        );
                    }
                }
            }
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    relay = %url,
                    err = %err.fmt_compact(),
                    "Live connect failed"
                );
            }
        }

        // connection gone; wait out the backoff unless shutting down
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use purplepages_core::{Event, EventId, Kind, Pubkey, Sig};
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

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn saves_live_events_until_shutdown() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let connector = Arc::new(MemoryConnector::new());
        let relay = connector.relay("wss://live.example.com");

        let (controller, shutdown) = ShutdownController::new();
        let subscriber = LiveSubscriber::new(
            store.clone(),
            connector.clone(),
            vec!["wss://live.example.com".to_owned()],
            [Kind::PROFILE].into_iter().collect(),
            shutdown,
        );
        let worker = tokio::spawn(subscriber.run());

        // wait for the subscription to open, then push a live event
        for _ in 0..100 {
            if 0 < relay.subscribe_count() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        relay.push_live(profile(1, Timestamp::now().as_secs() + 1));

        let mut stored = 0;
        for _ in 0..100 {
            stored = store.event_count().await?;
            if stored == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored, 1);

        controller.shutdown();
        worker.await?;
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn shutdown_interrupts_reconnect_backoff() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let connector = Arc::new(MemoryConnector::new());
        let relay = connector.relay("wss://down.example.com");
        relay.fail_next_connects(usize::MAX);

        let (controller, shutdown) = ShutdownController::new();
        let subscriber = LiveSubscriber::new(
            store,
            connector.clone(),
            vec!["wss://down.example.com".to_owned()],
            [Kind::PROFILE].into_iter().collect(),
            shutdown,
        );
        let worker = tokio::spawn(subscriber.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
        // must exit promptly despite the 30s reconnect backoff
        tokio::time::timeout(Duration::from_secs(5), worker).await??;
        Ok(())
    }
}

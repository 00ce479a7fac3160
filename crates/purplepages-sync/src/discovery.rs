use std::ops::ControlFlow;
use std::sync::Arc;

use purplepages_analytics::AnalyticsDb;
use purplepages_core::{Event, Filter, Kind, Timestamp};
use purplepages_store::{EventStore, StoreResult, DEFAULT_SCAN_PAGE};
use purplepages_util::{FmtCompact as _, ShutdownToken};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::normalize_relay_url;

const LOG_TARGET: &str = "purplepages::sync::discovery";

/// Bound on the new-peer notification channel. On overflow the newest
/// notification is dropped; the peer queue observes the registry again on
/// its next tick anyway.
const DISCOVERED_CHANNEL_CAPACITY: usize = 256;

/// Watches saved relay-list events and registers the relays they advertise.
pub struct PeerDiscovery {
    store: Arc<EventStore>,
    analytics: Arc<AnalyticsDb>,
    discovered_tx: mpsc::Sender<String>,
    shutdown: ShutdownToken,
}

impl PeerDiscovery {
    pub fn new(
        store: Arc<EventStore>,
        analytics: Arc<AnalyticsDb>,
        shutdown: ShutdownToken,
    ) -> (Self, mpsc::Receiver<String>) {
        let (discovered_tx, discovered_rx) = mpsc::channel(DISCOVERED_CHANNEL_CAPACITY);
        (
            Self {
                store,
                analytics,
                discovered_tx,
                shutdown,
            },
            discovered_rx,
        )
    }

    /// One-shot pass over every relay-list event already stored.
    pub async fn backfill(&self) -> StoreResult<()> {
        let filter = Filter {
            kinds: Some([Kind::RELAY_LIST].into()),
            ..Default::default()
        };
        let mut urls: Vec<String> = Vec::new();
        self.store
            .scan(&filter, DEFAULT_SCAN_PAGE, |event| {
                urls.extend(event.tag_values("r").map(str::to_owned));
                ControlFlow::Continue(())
            })
            .await?;

        info!(target: LOG_TARGET, candidates = urls.len(), "Backfilling discovered relays");
        for url in urls {
            self.register(&url).await;
        }
        Ok(())
    }

    pub async fn run(mut self) {
        let mut saved_rx = self.store.subscribe_saved();
        debug!(target: LOG_TARGET, "Starting peer discovery");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                saved = saved_rx.recv() => match saved {
                    Ok(event) => {
                        if event.kind == Kind::RELAY_LIST {
                            self.process_relay_list(&event).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: LOG_TARGET, skipped, "Discovery lagging behind saves");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(target: LOG_TARGET, "Peer discovery stopped");
    }

    async fn process_relay_list(&self, event: &Event) {
        for url in event.tag_values("r") {
            self.register(url).await;
        }
    }

    async fn register(&self, url: &str) {
        let normalized = match normalize_relay_url(url) {
            Ok(normalized) => normalized,
            Err(err) => {
                debug!(target: LOG_TARGET, url, err = %err, "Ignoring relay URL");
                return;
            }
        };

        match self
            .analytics
            .upsert_discovered_relay(&normalized, Timestamp::now())
            .await
        {
            Ok(true) => {
                info!(target: LOG_TARGET, url = %normalized, "Discovered new relay");
                // non-blocking: dropping the notification is fine, the
                // registry row is already there
                let _ = self.discovered_tx.try_send(normalized);
            }
            Ok(false) => {}
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    url = %normalized,
                    err = %err.fmt_compact(),
                    "Failed to upsert discovered relay"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use purplepages_core::{EventId, Pubkey, Sig, Tag};
    use purplepages_util::{BoxedErrorResult, ShutdownController};

    use super::*;

    fn relay_list(id_byte: u8, urls: &[&str]) -> Event {
        Event {
            id: EventId::from_bytes([id_byte; 32]),
            pubkey: Pubkey::from_bytes([id_byte; 32]),
            created_at: Timestamp::from_secs(1000),
            kind: Kind::RELAY_LIST,
            tags: urls.iter().map(|url| Tag::new(["r", *url])).collect(),
            content: String::new(),
            sig: Sig::ZERO,
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn live_discovery_registers_normalized_urls() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let (controller, shutdown) = ShutdownController::new();

        let (discovery, mut discovered_rx) =
            PeerDiscovery::new(store.clone(), analytics.clone(), shutdown);
        let worker = tokio::spawn(discovery.run());

        store
            .save(&relay_list(
                1,
                &["WSS://Relay.Example.Com/", "ws://10.0.0.1", "junk url"],
            ))
            .await?;

        let discovered = discovered_rx.recv().await.expect("one discovery");
        assert_eq!(discovered, "wss://relay.example.com");

        // the blocked and malformed URLs never reached the registry
        assert_eq!(analytics.relay_count().await?, 1);

        // same relay again: no new notification
        store.save(&relay_list(2, &["wss://relay.example.com"])).await?;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(discovered_rx.try_recv().is_err());

        controller.shutdown();
        worker.await?;
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn backfill_scans_existing_relay_lists() -> BoxedErrorResult<()> {
        let store = Arc::new(EventStore::new_in_memory(false).await?);
        let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
        let (_controller, shutdown) = ShutdownController::new();

        store.save(&relay_list(1, &["wss://a.example.com"])).await?;
        store.save(&relay_list(2, &["wss://b.example.com:7777"])).await?;

        let (discovery, _discovered_rx) =
            PeerDiscovery::new(store.clone(), analytics.clone(), shutdown);
        discovery.backfill().await?;

        assert_eq!(analytics.relay_count().await?, 2);
        Ok(())
    }
}

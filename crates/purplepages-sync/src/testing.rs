//! Scripted in-memory relays for exercising the syncers without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use purplepages_core::{Event, EventId, Filter};
use tokio::sync::broadcast;

use crate::connector::{
    ConnectSnafu, ConnectorResult, RelayConnector, RelaySession, SubItem,
};
use snafu::ensure;

/// A fake peer relay: seeded stored events plus a live feed.
#[derive(Debug)]
pub struct MemoryRelay {
    stored: Mutex<Vec<Event>>,
    live_tx: broadcast::Sender<Event>,
    subscribe_count: AtomicUsize,
    connect_count: AtomicUsize,
    fail_next_connects: AtomicUsize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        let (live_tx, _) = broadcast::channel(256);
        Self {
            stored: Mutex::new(Vec::new()),
            live_tx,
            subscribe_count: AtomicUsize::new(0),
            connect_count: AtomicUsize::new(0),
            fail_next_connects: AtomicUsize::new(0),
        }
    }
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, events: impl IntoIterator<Item = Event>) {
        self.stored.lock().expect("Locking failed").extend(events);
    }

    /// Deliver an event to every open subscription that matches it.
    pub fn push_live(&self, event: Event) {
        let _ = self.live_tx.send(event);
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::Relaxed)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next_connects.store(n, Ordering::Relaxed);
    }

    /// Stored events matching any filter, newest-first, per-filter limits
    /// applied.
    fn query(&self, filters: &[Filter]) -> Vec<Event> {
        let stored = self.stored.lock().expect("Locking failed");
        let mut seen: HashSet<EventId> = HashSet::new();
        let mut out: Vec<Event> = Vec::new();
        for filter in filters {
            let mut matched: Vec<Event> = stored
                .iter()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect();
            matched.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            if let Some(limit) = filter.limit {
                matched.truncate(limit);
            }
            for event in matched {
                if seen.insert(event.id) {
                    out.push(event);
                }
            }
        }
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

/// Connector resolving URLs to [`MemoryRelay`]s.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    relays: Mutex<HashMap<String, Arc<MemoryRelay>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the relay behind `url`.
    pub fn relay(&self, url: &str) -> Arc<MemoryRelay> {
        self.relays
            .lock()
            .expect("Locking failed")
            .entry(url.to_owned())
            .or_insert_with(MemoryRelay::new)
            .clone()
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(
        &self,
        url: &str,
        _timeout: Duration,
    ) -> ConnectorResult<Box<dyn RelaySession>> {
        let relay = {
            let relays = self.relays.lock().expect("Locking failed");
            relays.get(url).cloned()
        };
        let relay = relay.ok_or_else(|| {
            ConnectSnafu {
                url: url.to_owned(),
                message: "unknown relay".to_owned(),
            }
            .build()
        })?;

        let failing = relay
            .fail_next_connects
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        ensure!(
            !failing,
            ConnectSnafu {
                url: url.to_owned(),
                message: "scripted connect failure".to_owned(),
            }
        );
        relay.connect_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(MemorySession {
            relay,
            queue: VecDeque::new(),
            live_rx: None,
            filters: Vec::new(),
            closed: false,
        }))
    }
}

struct MemorySession {
    relay: Arc<MemoryRelay>,
    queue: VecDeque<SubItem>,
    live_rx: Option<broadcast::Receiver<Event>>,
    filters: Vec<Filter>,
    closed: bool,
}

#[async_trait]
impl RelaySession for MemorySession {
    async fn subscribe(&mut self, filters: &[Filter]) -> ConnectorResult<()> {
        self.relay.subscribe_count.fetch_add(1, Ordering::Relaxed);
        self.filters = filters.to_vec();
        self.queue = self
            .relay
            .query(filters)
            .into_iter()
            .map(SubItem::Event)
            .collect();
        self.queue.push_back(SubItem::Eose);
        self.live_rx = Some(self.relay.live_tx.subscribe());
        Ok(())
    }

    async fn publish(&mut self, event: &Event) -> ConnectorResult<()> {
        self.relay
            .stored
            .lock()
            .expect("Locking failed")
            .push(event.clone());
        Ok(())
    }

    async fn recv(&mut self) -> ConnectorResult<Option<SubItem>> {
        if self.closed {
            return Ok(None);
        }
        if let Some(item) = self.queue.pop_front() {
            return Ok(Some(item));
        }
        let Some(live_rx) = &mut self.live_rx else {
            return Ok(None);
        };
        loop {
            match live_rx.recv().await {
                Ok(event) => {
                    if self.filters.iter().any(|filter| filter.matches(&event)) {
                        return Ok(Some(SubItem::Event(event)));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn unsubscribe(&mut self) {
        self.queue.clear();
        self.live_rx = None;
        self.filters.clear();
    }

    async fn close(&mut self) {
        self.closed = true;
        self.live_rx = None;
    }
}

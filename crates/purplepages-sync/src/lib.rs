//! Replication: peer discovery and the four syncer workers.
//!
//! All peer traffic goes through the [`connector`] traits; the wire codec
//! behind them is pluggable (production uses the websocket adapter, tests a
//! scripted in-memory fake). Workers never crash the process: peer failures
//! are counted, logged, and the next peer is attempted.

pub mod connector;
pub mod discovery;
pub mod historical;
pub mod live;
pub mod normalize;
pub mod peer_queue;
pub mod testing;
pub mod trusted;

use std::collections::HashSet;
use std::sync::Arc;

use purplepages_core::Pubkey;

pub use self::connector::{ConnectorError, ConnectorResult, RelayConnector, RelaySession, SubItem};
pub use self::discovery::PeerDiscovery;
pub use self::historical::HistoricalSyncer;
pub use self::live::LiveSubscriber;
pub use self::normalize::{normalize_relay_url, NormalizeError};
pub use self::peer_queue::PeerQueueWorker;
pub use self::trusted::{TrustedSyncer, TrustedSyncerConfig};

/// Read side of the live trusted set, published by the graph analyzer.
pub type TrustedWatch = tokio::sync::watch::Receiver<Arc<HashSet<Pubkey>>>;

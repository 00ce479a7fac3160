use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use purplepages_analytics::{AnalyticsDb, AnalyticsError};
use purplepages_store::{EventStore, StoreError};
use purplepages_sync::{
    HistoricalSyncer, LiveSubscriber, PeerDiscovery, PeerQueueWorker, RelayConnector,
    TrustedSyncer, TrustedSyncerConfig,
};
use purplepages_util::{FmtCompact as _, ShutdownController, ShutdownToken};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admission::AdmissionGate;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::req_tracker::RequestTracker;
use crate::task::analyzer::{AnalyzerConfig, GraphAnalyzer};
use crate::task::snapshotter::Snapshotter;
use crate::trusted_set::TrustedSet;
use crate::KindAllowlist;

const LOG_TARGET: &str = "purplepages::service::supervisor";

/// Peer-queue rotation starts once the historical sync has had a head
/// start.
const PEER_QUEUE_START_DELAY: Duration = Duration::from_secs(2 * 60);
/// The trusted syncer waits for the first analyzer cycle.
const TRUSTED_SYNC_START_DELAY: Duration = Duration::from_secs(6 * 60);
/// How long shutdown waits for workers before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("Cannot create data directory {}", path.display()))]
    CreateDataDir {
        source: io::Error,
        path: PathBuf,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Cannot open event store"))]
    OpenStore {
        source: StoreError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Cannot open analytics store"))]
    OpenAnalytics {
        source: AnalyticsError,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type InitResult<T> = std::result::Result<T, InitError>;

/// Every shared component, built once at startup and handed to the
/// transport layer and the background workers. No ambient globals: the
/// process has exactly one of these.
pub struct Services {
    pub config: Config,
    pub store: Arc<EventStore>,
    pub analytics: Arc<AnalyticsDb>,
    pub trusted: Arc<TrustedSet>,
    pub admission: Arc<AdmissionGate>,
    pub tracker: Arc<RequestTracker>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Services {
    /// Open the stores and wire the shared components.
    ///
    /// Failures here are the only fatal errors in the system; everything
    /// after startup degrades and retries instead of exiting.
    pub async fn init(config: Config) -> InitResult<Services> {
        tokio::fs::create_dir_all(&config.storage.path)
            .await
            .context(CreateDataDirSnafu {
                path: config.storage.path.clone(),
            })?;

        let store = Arc::new(
            EventStore::open(
                config.storage.path.join("events.redb"),
                config.storage.archive_enabled,
            )
            .await
            .context(OpenStoreSnafu)?,
        );
        let analytics = Arc::new(
            AnalyticsDb::open(config.analytics_path())
                .await
                .context(OpenAnalyticsSnafu)?,
        );

        // the persisted trusted set carries over restarts until the first
        // analyzer cycle replaces it
        let initial_trusted: HashSet<_> = analytics
            .trusted_pubkeys()
            .await
            .context(OpenAnalyticsSnafu)?;
        info!(
            target: LOG_TARGET,
            trusted = initial_trusted.len(),
            "Loaded persisted trusted set"
        );
        let trusted = Arc::new(TrustedSet::new(initial_trusted));

        let allowed: KindAllowlist = Arc::new(config.allowed_kinds().into_iter().collect());
        let admission = Arc::new(AdmissionGate::new(
            allowed,
            config.limits.clone(),
            analytics.clone(),
        ));
        let tracker = Arc::new(RequestTracker::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            analytics.clone(),
            admission.clone(),
            tracker.clone(),
        ));

        Ok(Services {
            config,
            store,
            analytics,
            trusted,
            admission,
            tracker,
            dispatcher,
        })
    }

    /// Spawn every background worker in startup order.
    ///
    /// The returned handles are joined (bounded) during shutdown.
    pub fn spawn_workers(
        &self,
        connector: Arc<dyn RelayConnector>,
        shutdown: ShutdownToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let sync_kinds = self
            .config
            .sync
            .kinds
            .clone()
            .unwrap_or_else(|| self.config.sync_kinds());

        handles.push(tokio::spawn(
            self.tracker
                .clone()
                .run_flusher(self.analytics.clone(), shutdown.clone()),
        ));

        let (discovery, discovered_rx) = PeerDiscovery::new(
            self.store.clone(),
            self.analytics.clone(),
            shutdown.clone(),
        );
        handles.push(tokio::spawn(async move {
            if let Err(err) = discovery.backfill().await {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Relay discovery backfill failed"
                );
            }
            discovery.run().await;
        }));

        if self.config.sync.enabled && !self.config.sync.relays.is_empty() {
            let live = LiveSubscriber::new(
                self.store.clone(),
                connector.clone(),
                self.config.sync.relays.clone(),
                sync_kinds.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(live.run()));

            let historical = HistoricalSyncer::new(
                self.store.clone(),
                connector.clone(),
                self.config.sync.relays.clone(),
                sync_kinds.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(historical.run()));
        }

        let peer_queue = PeerQueueWorker::new(
            self.store.clone(),
            self.analytics.clone(),
            connector.clone(),
            sync_kinds.clone(),
            discovered_rx,
            purplepages_sync::peer_queue::TICK_INTERVAL,
            shutdown.clone(),
        );
        handles.push(spawn_delayed(
            PEER_QUEUE_START_DELAY,
            shutdown.clone(),
            peer_queue.run(),
        ));

        if self.config.trusted_sync.enabled {
            let trusted_syncer = TrustedSyncer::new(
                self.store.clone(),
                self.analytics.clone(),
                connector.clone(),
                self.trusted.subscribe(),
                TrustedSyncerConfig {
                    interval: self.config.trusted_sync.interval(),
                    batch_size: self.config.trusted_sync.batch_size,
                    relay_timeout: self.config.trusted_sync.relay_timeout(),
                    kinds: sync_kinds.clone(),
                    missing_only: false,
                },
                shutdown.clone(),
            );
            handles.push(spawn_delayed(
                TRUSTED_SYNC_START_DELAY,
                shutdown.clone(),
                trusted_syncer.run(),
            ));
        }

        if self.config.profile_hydration.enabled {
            let hydrator = TrustedSyncer::new(
                self.store.clone(),
                self.analytics.clone(),
                connector,
                self.trusted.subscribe(),
                TrustedSyncerConfig {
                    interval: self.config.profile_hydration.interval(),
                    batch_size: self.config.profile_hydration.batch_size,
                    relay_timeout: self.config.trusted_sync.relay_timeout(),
                    kinds: [purplepages_core::Kind::PROFILE, purplepages_core::Kind::CONTACTS]
                        .into_iter()
                        .collect(),
                    missing_only: true,
                },
                shutdown.clone(),
            );
            handles.push(spawn_delayed(
                TRUSTED_SYNC_START_DELAY,
                shutdown.clone(),
                hydrator.run(),
            ));
        }

        let analyzer = GraphAnalyzer::new(
            self.store.clone(),
            self.analytics.clone(),
            self.trusted.clone(),
            AnalyzerConfig {
                counted_kinds: self.config.allowed_kinds(),
                archive_enabled: self.config.storage.archive_enabled,
                ..Default::default()
            },
            shutdown.clone(),
        );
        handles.push(tokio::spawn(analyzer.run()));

        let snapshotter = Snapshotter::new(
            self.store.clone(),
            self.analytics.clone(),
            shutdown.clone(),
        );
        handles.push(tokio::spawn(snapshotter.run()));

        info!(target: LOG_TARGET, workers = handles.len(), "Background workers started");
        handles
    }
}

fn spawn_delayed(
    delay: Duration,
    mut shutdown: ShutdownToken,
    task: impl std::future::Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        task.await;
    })
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Can't fail: registering SIGTERM");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Signal shutdown and wait (bounded) for every worker to drain.
pub async fn shutdown_workers(controller: ShutdownController, handles: Vec<JoinHandle<()>>) {
    info!(target: LOG_TARGET, "Shutting down workers");
    controller.shutdown();

    let join_all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
        warn!(target: LOG_TARGET, "Some workers did not stop in time; abandoning them");
    } else {
        info!(target: LOG_TARGET, "All workers stopped");
    }
}

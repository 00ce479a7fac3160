mod cli;

use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as _;
use cli::{Opts, OptsCmd, SyncDirection};
use purplepages_core::{Filter, KindSet};
use purplepages_service::supervisor::{shutdown_workers, wait_for_shutdown_signal, InitError};
use purplepages_service::task::analyzer::{AnalyzerConfig, GraphAnalyzer};
use purplepages_service::task::snapshotter::Snapshotter;
use purplepages_service::{Config, Services};
use purplepages_store::DEFAULT_SCAN_PAGE;
use purplepages_sync::{normalize_relay_url, HistoricalSyncer, NormalizeError, RelayConnector};
use purplepages_util::{FmtCompact as _, ShutdownController, WhateverResult};
use purplepages_web::{Server, ServerError};
use purplepages_wire::WsConnector;
use snafu::{Location, ResultExt as _, Snafu, Whatever};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "purplepages::cli";

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("Initialization error: {source}"))]
    Init { source: InitError },
    #[snafu(display("Server error: {source}"))]
    Server { source: ServerError },
    #[snafu(display("Cannot read config file: {source}"))]
    ConfigRead { source: io::Error },
    #[snafu(display("Cannot parse config file: {source}"))]
    ConfigParse { source: serde_json::Error },
    #[snafu(display("Invalid relay URL: {source}"))]
    RelayUrl { source: NormalizeError },
    #[snafu(display("Store error: {source}"))]
    Store {
        source: purplepages_store::StoreError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Sync error: {source}"))]
    Sync {
        source: purplepages_sync::ConnectorError,
    },
    #[snafu(display("Miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = Opts::parse();
    let mut config = load_config(opts.config.as_deref())?;
    if let Some(port) = opts.port {
        config.server.port = port;
    }

    match opts.cmd {
        None => run_relay(config).await,
        Some(OptsCmd::Sync {
            kinds,
            direction,
            relay_url,
        }) => run_oneshot_sync(config, kinds, direction, &relay_url).await,
        Some(OptsCmd::Analytics) => run_analytics(config).await,
    }
}

fn init_logging() -> WhateverResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> CliResult<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let raw = std::fs::read_to_string(path).context(ConfigReadSnafu)?;
    serde_json::from_str(&raw).context(ConfigParseSnafu)
}

async fn run_relay(config: Config) -> CliResult<()> {
    let test_mode = config.server.is_test_mode();
    let services = Services::init(config).await.context(InitSnafu)?;
    let connector: Arc<dyn RelayConnector> = Arc::new(WsConnector::new());
    let (controller, shutdown) = ShutdownController::new();

    if test_mode {
        // port 9999: catch up from the configured relays once and exit
        info!(target: LOG_TARGET, "Test mode: one-shot sync and exit");
        let syncer = HistoricalSyncer::new(
            services.store.clone(),
            connector,
            services.config.sync.relays.clone(),
            services.config.sync_kinds(),
            shutdown,
        );
        syncer.run().await;
        return Ok(());
    }

    let mut handles = services.spawn_workers(connector, shutdown.clone());

    let server = Server::init(&services).await.context(ServerSnafu)?;
    handles.push(tokio::spawn(async move {
        if let Err(err) = server.run(shutdown).await {
            warn!(target: LOG_TARGET, err = %err.fmt_compact(), "HTTP server failed");
        }
    }));

    wait_for_shutdown_signal().await;
    info!(target: LOG_TARGET, "Shutdown signal received");
    shutdown_workers(controller, handles).await;
    Ok(())
}

async fn run_oneshot_sync(
    config: Config,
    kinds: Option<KindSet>,
    direction: SyncDirection,
    relay_url: &str,
) -> CliResult<()> {
    let relay_url = normalize_relay_url(relay_url).context(RelayUrlSnafu)?;
    let kinds = kinds.unwrap_or_else(|| config.sync_kinds());
    let services = Services::init(config).await.context(InitSnafu)?;
    let connector: Arc<dyn RelayConnector> = Arc::new(WsConnector::new());
    let (_controller, shutdown) = ShutdownController::new();

    if direction.pulls() {
        info!(target: LOG_TARGET, relay = %relay_url, kinds = %kinds, "Pulling from relay");
        let syncer = HistoricalSyncer::new(
            services.store.clone(),
            connector.clone(),
            vec![relay_url.clone()],
            kinds.clone(),
            shutdown,
        );
        syncer.run().await;
    }

    if direction.pushes() {
        info!(target: LOG_TARGET, relay = %relay_url, kinds = %kinds, "Pushing to relay");
        let mut session = connector
            .connect(&relay_url, Duration::from_secs(30))
            .await
            .context(SyncSnafu)?;

        let filter = Filter {
            kinds: Some(kinds.iter().collect()),
            ..Default::default()
        };
        let mut events = Vec::new();
        services
            .store
            .scan(&filter, DEFAULT_SCAN_PAGE, |event| {
                events.push(event);
                ControlFlow::Continue(())
            })
            .await
            .context(StoreSnafu)?;

        let total = events.len();
        for event in events {
            session.publish(&event).await.context(SyncSnafu)?;
        }
        session.close().await;
        info!(target: LOG_TARGET, pushed = total, "Push complete");
    }

    Ok(())
}

/// `purplepages analytics`: only the graph analyzer and the snapshotter.
async fn run_analytics(config: Config) -> CliResult<()> {
    let archive_enabled = config.storage.archive_enabled;
    let counted_kinds = config.allowed_kinds();
    let services = Services::init(config).await.context(InitSnafu)?;
    let (controller, shutdown) = ShutdownController::new();

    let analyzer = GraphAnalyzer::new(
        services.store.clone(),
        services.analytics.clone(),
        services.trusted.clone(),
        AnalyzerConfig {
            counted_kinds,
            archive_enabled,
            ..Default::default()
        },
        shutdown.clone(),
    );
    let snapshotter = Snapshotter::new(
        services.store.clone(),
        services.analytics.clone(),
        shutdown.clone(),
    )
    .with_timing(Duration::from_secs(1), Duration::from_secs(24 * 60 * 60));

    let handles = vec![tokio::spawn(analyzer.run()), tokio::spawn(snapshotter.run())];

    wait_for_shutdown_signal().await;
    info!(target: LOG_TARGET, "Shutdown signal received");
    shutdown_workers(controller, handles).await;
    Ok(())
}

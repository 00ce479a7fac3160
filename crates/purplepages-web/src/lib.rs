//! HTTP surface: relay metadata, the websocket endpoint, and the stats
//! pages (all JSON).

mod auth;
mod error;
mod relay_ws;
mod routes;

use std::net::SocketAddr;
use std::str::FromStr as _;
use std::sync::Arc;

use axum::Router;
use purplepages_service::Services;
use purplepages_util::ShutdownToken;
use snafu::{Location, ResultExt as _, Snafu};
use tokio::net::{TcpListener, TcpSocket};
use tower_http::cors::CorsLayer;
use tracing::info;

pub use self::error::WebError;

const LOG_TARGET: &str = "purplepages::web";

/// The full route tree over a shared state; [`Server`] serves this, and
/// tests drive it directly.
pub fn router(state: SharedAppState) -> Router {
    routes::route_handler(state).layer(CorsLayer::permissive())
}

pub struct AppState {
    pub config: purplepages_service::Config,
    pub store: Arc<purplepages_store::EventStore>,
    pub analytics: Arc<purplepages_analytics::AnalyticsDb>,
    pub dispatcher: Arc<purplepages_service::Dispatcher>,
    pub trusted: Arc<purplepages_service::TrustedSet>,
}

pub type SharedAppState = Arc<AppState>;

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(transparent)]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    ListenAddr {
        source: std::net::AddrParseError,
        addr: String,
    },
}
pub type ServerResult<T> = std::result::Result<T, ServerError>;

pub struct Server {
    listener: TcpListener,
    state: SharedAppState,
}

impl Server {
    pub async fn init(services: &Services) -> ServerResult<Server> {
        let addr = format!(
            "{}:{}",
            services.config.server.host, services.config.server.port
        );
        let listener = Self::get_listener(&addr).await?;

        let state = Arc::new(AppState {
            config: services.config.clone(),
            store: services.store.clone(),
            analytics: services.analytics.clone(),
            dispatcher: services.dispatcher.clone(),
            trusted: services.trusted.clone(),
        });

        info!(target: LOG_TARGET, "Listening on {}", listener.local_addr()?);
        Ok(Self { listener, state })
    }

    async fn get_listener(addr: &str) -> ServerResult<TcpListener> {
        let addr = SocketAddr::from_str(addr).context(ListenAddrSnafu { addr })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: ShutdownToken) -> ServerResult<()> {
        let router = router(self.state.clone());

        info!(target: LOG_TARGET, "Starting HTTP server");
        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
        info!(target: LOG_TARGET, "HTTP server stopped");
        Ok(())
    }
}

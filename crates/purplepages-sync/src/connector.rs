use std::time::Duration;

use async_trait::async_trait;
use purplepages_core::{Event, Filter};
use snafu::Snafu;

/// An item delivered on an open subscription.
#[derive(Debug, Clone)]
pub enum SubItem {
    Event(Event),
    /// End of stored events: the peer's backlog for this subscription is
    /// drained; anything after this is live.
    Eose,
    /// The peer closed the subscription with a reason.
    Closed(String),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnectorError {
    #[snafu(display("Connection to {url} failed: {message}"))]
    Connect { url: String, message: String },
    #[snafu(display("Connection to {url} timed out"))]
    ConnectTimeout { url: String },
    #[snafu(display("Subscribe failed: {message}"))]
    Subscribe { message: String },
    #[snafu(display("Receive failed: {message}"))]
    Recv { message: String },
}
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Client side of the relay wire protocol.
///
/// The codec behind this seam is an external collaborator; the syncers only
/// depend on these traits. Implementations must enforce `timeout` on the
/// dial themselves.
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> ConnectorResult<Box<dyn RelaySession>>;
}

/// One open connection to a peer, carrying at most one subscription at a
/// time - the access pattern of every syncer.
#[async_trait]
pub trait RelaySession: Send {
    /// Replace the session's subscription with a new one.
    async fn subscribe(&mut self, filters: &[Filter]) -> ConnectorResult<()>;

    /// Publish an event to the peer (fire-and-forget; the peer's `OK`
    /// response is not awaited).
    async fn publish(&mut self, event: &Event) -> ConnectorResult<()>;

    /// Next subscription item; `None` when the connection is gone.
    async fn recv(&mut self) -> ConnectorResult<Option<SubItem>>;

    /// Close the current subscription, keeping the connection usable.
    async fn unsubscribe(&mut self);

    /// Close the connection gracefully.
    async fn close(&mut self);
}

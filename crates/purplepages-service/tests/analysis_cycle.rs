//! End-to-end analyzer cycle over a seeded event store.

use std::sync::Arc;
use std::time::Duration;

use purplepages_analytics::AnalyticsDb;
use purplepages_core::{Event, EventId, Kind, KindSet, Pubkey, Sig, Tag, Timestamp};
use purplepages_service::task::analyzer::{AnalyzerConfig, GraphAnalyzer};
use purplepages_service::task::snapshotter::Snapshotter;
use purplepages_service::TrustedSet;
use purplepages_store::EventStore;
use purplepages_util::{BoxedErrorResult, ShutdownController};

fn pk(n: u8) -> Pubkey {
    Pubkey::from_bytes([n; 32])
}

fn contact_list(id_byte: u8, author: Pubkey, followees: &[Pubkey]) -> Event {
    Event {
        id: EventId::from_bytes([id_byte; 32]),
        pubkey: author,
        created_at: Timestamp::from_secs(1000),
        kind: Kind::CONTACTS,
        tags: followees
            .iter()
            .map(|followee| Tag::new(["p", &followee.to_string()]))
            .collect(),
        content: String::new(),
        sig: Sig::ZERO,
    }
}

fn interests(id_byte: u8, author: Pubkey, topics: &[&str]) -> Event {
    Event {
        id: EventId::from_bytes([id_byte; 32]),
        pubkey: author,
        created_at: Timestamp::from_secs(1000),
        kind: Kind::INTERESTS,
        tags: topics.iter().map(|topic| Tag::new(["t", *topic])).collect(),
        content: String::new(),
        sig: Sig::ZERO,
    }
}

/// A community of mutually-following users plus an isolated bot clique.
async fn seed(store: &EventStore) -> BoxedErrorResult<()> {
    // main community: 1..=5 all follow each other
    let community: Vec<Pubkey> = (1..=5).map(pk).collect();
    for (i, author) in community.iter().enumerate() {
        let followees: Vec<Pubkey> = community
            .iter()
            .copied()
            .filter(|other| other != author)
            .collect();
        store
            .save(&contact_list(10 + i as u8, *author, &followees))
            .await?;
    }

    // bot clique: 101..=103, fully mutual, no outside edges
    let bots: Vec<Pubkey> = (101..=103).map(pk).collect();
    for (i, author) in bots.iter().enumerate() {
        let followees: Vec<Pubkey> = bots
            .iter()
            .copied()
            .filter(|other| other != author)
            .collect();
        store
            .save(&contact_list(30 + i as u8, *author, &followees))
            .await?;
    }

    store.save(&interests(50, pk(1), &["nostr", "rust"])).await?;
    store.save(&interests(51, pk(2), &["nostr"])).await?;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn full_cycle_produces_all_derived_state() -> BoxedErrorResult<()> {
    let store = Arc::new(EventStore::new_in_memory(false).await?);
    let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
    let trusted = Arc::new(TrustedSet::new(Default::default()));
    let (_controller, shutdown) = ShutdownController::new();
    seed(&store).await?;

    let analyzer = GraphAnalyzer::new(
        store.clone(),
        analytics.clone(),
        trusted.clone(),
        AnalyzerConfig {
            // the seed component is everyone reachable; with threshold 2
            // the community promotes itself and the bots stay out only if
            // disconnected (they are their own component)
            trust_threshold: 2,
            counted_kinds: KindSet::default_allowed(),
            ..Default::default()
        },
        shutdown,
    );
    analyzer.run_cycle().await?;

    // trust: the 5-member community is the largest weak component
    let snapshot = trusted.snapshot();
    assert_eq!(snapshot.len(), 5);
    for n in 1..=5 {
        assert!(snapshot.contains(&pk(n)));
    }
    assert!(!snapshot.contains(&pk(101)));
    assert_eq!(analytics.trusted_count().await?, 5);

    // bot clique flagged (density 1.0, no external edges)
    let members = analytics.active_bot_cluster_members().await?;
    assert_eq!(members, [pk(101), pk(102), pk(103)].into());

    // communities: both cliques detected
    let communities = analytics.communities().await?;
    assert_eq!(communities.len(), 2);
    assert_eq!(communities[0].size, 5);
    assert_eq!(communities[1].size, 3);

    // derived caches
    assert_eq!(analytics.follower_count(pk(1)).await?, 4);
    let interests = analytics.top_interests(10).await?;
    assert_eq!(interests[0], ("nostr".to_owned(), 2));
    let social = analytics.social_counts().await?;
    assert!(social.contains(&("contact_lists".to_owned(), 8)));
    assert!(social.contains(&("trusted_pubkeys".to_owned(), 5)));
    let event_counts = analytics.event_counts().await?;
    assert!(event_counts.contains(&(Kind::CONTACTS, 8)));
    assert!(event_counts.contains(&(Kind::INTERESTS, 2)));

    // spam: untrusted bot-cluster members are candidates
    let spam = analytics.unpurged_spam_candidates().await?;
    let spam_keys: Vec<Pubkey> = spam.iter().map(|row| row.pubkey).collect();
    for bot in [pk(101), pk(102), pk(103)] {
        assert!(spam_keys.contains(&bot), "bot {bot} not flagged");
    }
    assert!(!spam_keys.contains(&pk(1)));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn second_cycle_replaces_rather_than_accumulates() -> BoxedErrorResult<()> {
    let store = Arc::new(EventStore::new_in_memory(false).await?);
    let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
    let trusted = Arc::new(TrustedSet::new(Default::default()));
    let (_controller, shutdown) = ShutdownController::new();
    seed(&store).await?;

    let analyzer = GraphAnalyzer::new(
        store.clone(),
        analytics.clone(),
        trusted.clone(),
        AnalyzerConfig {
            trust_threshold: 2,
            ..Default::default()
        },
        shutdown,
    );
    analyzer.run_cycle().await?;
    analyzer.run_cycle().await?;

    assert_eq!(analytics.trusted_count().await?, 5);
    assert_eq!(analytics.active_bot_cluster_count().await?, 1);
    assert_eq!(analytics.communities().await?.len(), 2);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn snapshotter_records_and_exits_cleanly() -> BoxedErrorResult<()> {
    let store = Arc::new(EventStore::new_in_memory(false).await?);
    let analytics = Arc::new(AnalyticsDb::open_in_memory()?);
    let (controller, shutdown) = ShutdownController::new();
    seed(&store).await?;

    let snapshotter = Snapshotter::new(store.clone(), analytics.clone(), shutdown)
        .with_timing(Duration::from_millis(10), Duration::from_secs(3600));
    let handle = tokio::spawn(snapshotter.run());

    let mut history = vec![];
    for _ in 0..200 {
        history = analytics.storage_history().await?;
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_count, 10);

    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle).await??;
    Ok(())
}

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use purplepages_core::{Event, EventId, Filter, Kind, Pubkey, Sig, Tag, Timestamp};
use purplepages_util::BoxedErrorResult;

use crate::{event_history, EventStore, SaveOutcome, DEFAULT_SCAN_PAGE};

fn id(n: u64) -> EventId {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    EventId::from_bytes(bytes)
}

fn author(n: u8) -> Pubkey {
    Pubkey::from_bytes([n; 32])
}

fn event(event_id: EventId, pubkey: Pubkey, created_at: u64, kind: u16) -> Event {
    Event {
        id: event_id,
        pubkey,
        created_at: Timestamp::from_secs(created_at),
        kind: Kind::new(kind),
        tags: vec![],
        content: String::new(),
        sig: Sig::ZERO,
    }
}

fn event_with_tags(
    event_id: EventId,
    pubkey: Pubkey,
    created_at: u64,
    kind: u16,
    tags: Vec<Tag>,
) -> Event {
    Event {
        tags,
        ..event(event_id, pubkey, created_at, kind)
    }
}

async fn temp_store() -> BoxedErrorResult<EventStore> {
    Ok(EventStore::new_in_memory(false).await?)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn save_duplicate_is_sentinel() -> BoxedErrorResult<()> {
    let store = temp_store().await?;

    let ev = event(id(1), author(1), 100, 1);
    assert_eq!(store.save(&ev).await?, SaveOutcome::Saved);
    assert_eq!(store.save(&ev).await?, SaveOutcome::Duplicate);

    // duplicate save must not mutate state
    assert_eq!(store.event_count().await?, 1);
    assert!(store.has_event(ev.id).await?);
    assert!(!store.has_event(id(2)).await?);
    assert_eq!(store.get_event(ev.id).await?, Some(ev));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn replaceable_tie_breaks_on_smaller_id() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    let alice = author(1);

    let a = event(
        EventId::from_bytes([0xaa; 32]),
        alice,
        100,
        0,
    );
    let b = event(
        EventId::from_bytes([0xbb; 32]),
        alice,
        100,
        0,
    );
    let c = event(EventId::from_bytes([0xcc; 32]), alice, 99, 0);

    assert_eq!(store.save(&a).await?, SaveOutcome::Saved);
    assert_eq!(store.save(&b).await?, SaveOutcome::Superseded);
    assert_eq!(store.save(&c).await?, SaveOutcome::Superseded);

    let filter = Filter {
        authors: Some([alice].into()),
        kinds: Some([Kind::PROFILE].into()),
        ..Default::default()
    };
    let results = store.query(&filter).await?;
    assert_eq!(results, vec![a]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn replaceable_eviction_in_any_arrival_order() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    let alice = author(1);

    let older = event(EventId::from_bytes([0xbb; 32]), alice, 100, 0);
    let winner = event(EventId::from_bytes([0xaa; 32]), alice, 100, 0);

    assert_eq!(store.save(&older).await?, SaveOutcome::Saved);
    assert_eq!(store.save(&winner).await?, SaveOutcome::Saved);

    let filter = Filter {
        authors: Some([alice].into()),
        kinds: Some([Kind::PROFILE].into()),
        ..Default::default()
    };
    assert_eq!(store.query(&filter).await?, vec![winner]);
    assert_eq!(store.event_count().await?, 1);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn addressable_slots_key_on_d_tag() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    let alice = author(1);

    let x = event_with_tags(
        EventId::from_bytes([0xaa; 32]),
        alice,
        100,
        30000,
        vec![Tag::new(["d", "x"])],
    );
    let y = event_with_tags(
        EventId::from_bytes([0xbb; 32]),
        alice,
        100,
        30000,
        vec![Tag::new(["d", "y"])],
    );
    assert_eq!(store.save(&x).await?, SaveOutcome::Saved);
    assert_eq!(store.save(&y).await?, SaveOutcome::Saved);

    let x2 = event_with_tags(
        EventId::from_bytes([0xcc; 32]),
        alice,
        101,
        30000,
        vec![Tag::new(["d", "x"])],
    );
    assert_eq!(store.save(&x2).await?, SaveOutcome::Saved);

    let filter = Filter {
        authors: Some([alice].into()),
        kinds: Some([Kind::FOLLOW_SETS].into()),
        ..Default::default()
    };
    let results = store.query(&filter).await?;
    assert_eq!(results, vec![x2, y]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn query_orders_descending_time_ascending_id() -> BoxedErrorResult<()> {
    let store = temp_store().await?;

    // regular kind so every copy is retained
    let e1 = event(id(3), author(1), 100, 1);
    let e2 = event(id(1), author(2), 100, 1);
    let e3 = event(id(2), author(3), 101, 1);
    for ev in [&e1, &e2, &e3] {
        store.save(ev).await?;
    }

    let results = store.query(&Filter::default()).await?;
    assert_eq!(results, vec![e3.clone(), e2.clone(), e1.clone()]);

    // a limit cut inside the tied second keeps id-ascending order
    let limited = store
        .query(&Filter {
            limit: Some(2),
            ..Default::default()
        })
        .await?;
    assert_eq!(limited, vec![e3, e2]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn count_agrees_with_query() -> BoxedErrorResult<()> {
    let store = temp_store().await?;

    for n in 0..40u64 {
        let tags = if n % 2 == 0 {
            vec![Tag::new(["t", "nostr"])]
        } else {
            vec![]
        };
        store
            .save(&event_with_tags(id(n), author((n % 5) as u8), 1000 + n / 4, 1, tags))
            .await?;
    }

    for filter in [
        Filter::default(),
        Filter {
            authors: Some([author(0), author(3)].into()),
            ..Default::default()
        },
        Filter {
            kinds: Some([Kind::new(1)].into()),
            since: Some(Timestamp::from_secs(1003)),
            until: Some(Timestamp::from_secs(1007)),
            ..Default::default()
        },
        Filter {
            tags: [('t', ["nostr".to_owned()].into())].into(),
            ..Default::default()
        },
    ] {
        let queried = store.query(&filter).await?.len();
        let counted = store.count(&filter).await?;
        assert_eq!(counted as usize, queried, "filter {filter:?}");
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn scan_visits_shared_timestamps_exactly_once() -> BoxedErrorResult<()> {
    let store = temp_store().await?;

    // 25 events inside one second forces several page splits mid-second
    let mut expected = HashSet::new();
    for n in 0..25u64 {
        let ev = event(id(n), author((n % 3) as u8), 500, 1);
        store.save(&ev).await?;
        expected.insert(ev.id);
    }
    for n in 100..110u64 {
        let ev = event(id(n), author(1), 490 + n - 100, 1);
        store.save(&ev).await?;
        expected.insert(ev.id);
    }

    let mut visited = vec![];
    store
        .scan(&Filter::default(), 10, |ev| {
            visited.push(ev.id);
            ControlFlow::Continue(())
        })
        .await?;

    let unique: HashSet<EventId> = visited.iter().copied().collect();
    assert_eq!(unique.len(), visited.len(), "scan yielded duplicates");
    assert_eq!(unique, expected, "scan missed events");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn scan_stops_early_on_break() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    for n in 0..20u64 {
        store.save(&event(id(n), author(1), 100 + n, 1)).await?;
    }

    let mut seen = 0;
    let visited = store
        .scan(&Filter::default(), 5, |_| {
            seen += 1;
            if seen == 7 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;
    assert_eq!(visited, 7);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_removes_all_index_entries() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    let ev = event_with_tags(
        id(1),
        author(1),
        100,
        10002,
        vec![Tag::new(["r", "wss://relay.example.com"])],
    );
    store.save(&ev).await?;

    assert!(store.delete(ev.id).await?);
    assert!(!store.delete(ev.id).await?);

    assert_eq!(store.query(&Filter::default()).await?, vec![]);
    let by_tag = store
        .query(&Filter {
            tags: [('r', ["wss://relay.example.com".to_owned()].into())].into(),
            ..Default::default()
        })
        .await?;
    assert_eq!(by_tag, vec![]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_by_author_leaves_others() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    for n in 0..6u64 {
        store.save(&event(id(n), author(1), 100 + n, 1)).await?;
    }
    store.save(&event(id(100), author(2), 100, 1)).await?;

    assert_eq!(store.delete_by_author(author(1)).await?, 6);
    let rest = store.query(&Filter::default()).await?;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].pubkey, author(2));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn superseded_contacts_are_archived_when_enabled() -> BoxedErrorResult<()> {
    let store = EventStore::new_in_memory(true).await?;
    let alice = author(1);

    let old = event(id(1), alice, 100, 3);
    let new = event(id(2), alice, 200, 3);
    store.save(&old).await?;
    store.save(&new).await?;

    let archived = store
        .read_with(|tx| {
            let history_tbl = tx.open_table(&event_history::TABLE)?;
            let mut out = vec![];
            for entry in history_tbl.range(..)? {
                let (_, value) = entry?;
                out.push(value.value().event);
            }
            Ok(out)
        })
        .await?;
    assert_eq!(archived, vec![old]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn latest_by_author_kind_picks_replacement_winner() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    let alice = author(1);

    // regular kind: several instances stored, newest (tie: smallest id) wins
    store.save(&event(id(5), alice, 100, 1)).await?;
    store.save(&event(id(3), alice, 200, 1)).await?;
    store.save(&event(id(4), alice, 200, 1)).await?;

    let latest = store
        .latest_by_author_kind(alice, Kind::new(1))
        .await?
        .expect("latest exists");
    assert_eq!(latest.id, id(3));

    assert_eq!(store.latest_by_author_kind(alice, Kind::PROFILE).await?, None);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn saved_events_are_broadcast_post_commit() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    let mut saved_rx = store.subscribe_saved();

    let ev = event(id(1), author(1), 100, 10002);
    store.save(&ev).await?;
    assert_eq!(saved_rx.recv().await?, ev);

    // duplicates are not re-announced
    store.save(&ev).await?;
    assert!(saved_rx.try_recv().is_err());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stream_yields_query_results() -> BoxedErrorResult<()> {
    let store = Arc::new(temp_store().await?);
    for n in 0..30u64 {
        store.save(&event(id(n), author(1), 100 + n, 1)).await?;
    }

    let filter = Filter {
        limit: Some(12),
        ..Default::default()
    };
    let mut rx = store.stream(filter.clone(), 5);
    let mut streamed = vec![];
    while let Some(ev) = rx.recv().await {
        streamed.push(ev);
    }
    assert_eq!(streamed, store.query(&filter).await?);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn count_hll_estimates_distinct_authors() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    for n in 0..50u64 {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&(n.wrapping_mul(0x9e37_79b9_7f4a_7c15)).to_be_bytes());
        bytes[8..16].copy_from_slice(&n.to_be_bytes());
        let pk = Pubkey::from_bytes(bytes);
        store.save(&event(id(n), pk, 100 + n, 1)).await?;
    }

    let (count, sketch) = store.count_hll(&Filter::default(), 0).await?;
    assert_eq!(count, 50);
    let estimate = sketch.estimate();
    assert!(
        30.0 < estimate && estimate < 80.0,
        "estimate {estimate} too far from 50"
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reopen_preserves_events_and_indexes() -> BoxedErrorResult<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("events.redb");

    {
        let store = EventStore::open(&path, false).await?;
        store
            .save(&event_with_tags(
                id(1),
                author(1),
                100,
                10002,
                vec![Tag::new(["r", "wss://relay.example.com"])],
            ))
            .await?;
        store.save(&event(id(2), author(2), 101, 0)).await?;
        assert!(0 < store.storage_bytes());
    }

    let store = EventStore::open(&path, false).await?;
    assert_eq!(store.event_count().await?, 2);

    // the duplicate sentinel survives restart
    assert_eq!(
        store.save(&event(id(2), author(2), 101, 0)).await?,
        SaveOutcome::Duplicate
    );
    // index queries still work against the reopened file
    let by_tag = store
        .query(&Filter {
            tags: [('r', ["wss://relay.example.com".to_owned()].into())].into(),
            ..Default::default()
        })
        .await?;
    assert_eq!(by_tag.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn oversized_tag_values_fall_back_to_time_scan() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    let long_value = "x".repeat(300);
    let ev = event_with_tags(
        id(1),
        author(1),
        100,
        30000,
        vec![Tag::new(["d".to_owned(), long_value.clone()])],
    );
    store.save(&ev).await?;

    // the value is too long to index, but a filter on it still matches
    // through the time-scan fallback
    let results = store
        .query(&Filter {
            tags: [('d', [long_value].into())].into(),
            ..Default::default()
        })
        .await?;
    assert_eq!(results, vec![ev]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn scan_respects_filter_limit() -> BoxedErrorResult<()> {
    let store = temp_store().await?;
    for n in 0..20u64 {
        store.save(&event(id(n), author(1), 100 + n, 1)).await?;
    }

    let visited = store
        .scan(
            &Filter {
                limit: Some(8),
                ..Default::default()
            },
            DEFAULT_SCAN_PAGE,
            |_| ControlFlow::Continue(()),
        )
        .await?;
    assert_eq!(visited, 8);
    Ok(())
}

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use purplepages_core::{Event, EventId, Filter, Kind, Pubkey, Timestamp};
use redb_bincode::ReadTransaction;

use crate::{
    events, events_by_author_kind, events_by_kind, events_by_tag, events_by_time, EventRecord,
    EventStore, QueryTimeoutSnafu, StoreResult, MAX_INDEXED_TAG_VALUE,
};

/// Budget for one query; runaway scans bail out instead of starving the
/// executor thread they block.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Coarse deadline check cadence (entries between checks).
const DEADLINE_STRIDE: usize = 1024;

struct Deadline {
    at: Instant,
    seen: usize,
}

impl Deadline {
    fn new() -> Self {
        Self {
            at: Instant::now() + READ_TIMEOUT,
            seen: 0,
        }
    }

    fn tick(&mut self) -> StoreResult<()> {
        self.seen += 1;
        if self.seen % DEADLINE_STRIDE == 0 && self.at < Instant::now() {
            return QueryTimeoutSnafu.fail();
        }
        Ok(())
    }
}

/// Delivery order of query results: `created_at` descending, id ascending.
pub(crate) fn rank(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

fn rank_pair(a: &(Timestamp, EventId), b: &(Timestamp, EventId)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1))
}

/// Collect `(created_at, id)` pairs from a newest-first range iterator.
///
/// With a bound, takes the top `bound` entries plus every entry tied with
/// the last second taken, so a later global sort can re-order ids inside
/// that second correctly.
fn take_ranked(
    iter: impl Iterator<Item = StoreResult<(Timestamp, EventId)>>,
    bound: Option<usize>,
    deadline: &mut Deadline,
    out: &mut Vec<(Timestamp, EventId)>,
) -> StoreResult<()> {
    let mut taken = 0usize;
    let mut boundary: Option<Timestamp> = None;
    for item in iter {
        let (ts, id) = item?;
        deadline.tick()?;
        if let Some(boundary) = boundary {
            if ts < boundary {
                break;
            }
        }
        out.push((ts, id));
        taken += 1;
        if boundary.is_none() && bound.is_some_and(|bound| bound <= taken) {
            boundary = Some(ts);
        }
    }
    Ok(())
}

impl EventStore {
    pub(crate) fn get_event_tx(
        event_id: EventId,
        events_tbl: &impl events::ReadableTable,
    ) -> StoreResult<Option<EventRecord>> {
        Ok(events_tbl.get(&event_id)?.map(|guard| guard.value()))
    }

    pub(crate) fn latest_by_author_kind_tx(
        tx: &ReadTransaction,
        author: Pubkey,
        kind: Kind,
    ) -> StoreResult<Option<Event>> {
        let by_author_kind_tbl = tx.open_table(&events_by_author_kind::TABLE)?;
        let events_tbl = tx.open_table(&events::TABLE)?;

        let min = (author, kind, Timestamp::ZERO, EventId::ZERO);
        let max = (author, kind, Timestamp::MAX, EventId::MAX);

        // Newest second first; inside it the smallest id is the winner.
        let mut winner: Option<(Timestamp, EventId)> = None;
        for entry in by_author_kind_tbl.range(&min..=&max)?.rev() {
            let (key, _) = entry?;
            let (_, _, ts, id) = key.value();
            match winner {
                None => winner = Some((ts, id)),
                Some((best_ts, best_id)) => {
                    if ts < best_ts {
                        break;
                    }
                    if id < best_id {
                        winner = Some((ts, id));
                    }
                }
            }
        }

        let Some((_, id)) = winner else {
            return Ok(None);
        };
        Ok(Self::get_event_tx(id, &events_tbl)?.map(|record| record.event))
    }

    /// Plan and run a filtered query against the narrowest usable index.
    ///
    /// Results are verified against the full filter, sorted newest-first
    /// (ids ascending inside a second), deduplicated, and truncated to
    /// `min(filter.limit, max)`.
    pub(crate) fn query_tx(
        tx: &ReadTransaction,
        filter: &Filter,
        max: usize,
    ) -> StoreResult<Vec<Event>> {
        let limit = filter.limit.unwrap_or(usize::MAX).min(max);
        if limit == 0 {
            return Ok(vec![]);
        }

        let since = filter.since.unwrap_or(Timestamp::ZERO);
        let until = filter.until.unwrap_or(Timestamp::MAX);
        if until < since {
            return Ok(vec![]);
        }

        let events_tbl = tx.open_table(&events::TABLE)?;
        let mut deadline = Deadline::new();

        // Conditions the chosen index can't encode force unbounded candidate
        // collection; otherwise each range is cut at `limit` (+ ties).
        let residual_free = filter.tags.is_empty() && filter.search.is_none();
        let bound = residual_free.then_some(limit);

        let mut candidates: Vec<(Timestamp, EventId)> = vec![];

        if let Some(ids) = &filter.ids {
            for id in ids {
                if let Some(record) = Self::get_event_tx(*id, &events_tbl)? {
                    candidates.push((record.event.created_at, record.event.id));
                }
            }
        } else if let Some(authors) = &filter.authors {
            let by_author_kind_tbl = tx.open_table(&events_by_author_kind::TABLE)?;
            match &filter.kinds {
                Some(kinds) => {
                    for author in authors {
                        for kind in kinds {
                            let min = (*author, *kind, since, EventId::ZERO);
                            let max_key = (*author, *kind, until, EventId::MAX);
                            take_ranked(
                                by_author_kind_tbl.range(&min..=&max_key)?.rev().map(
                                    |entry| {
                                        let (key, _) = entry?;
                                        let (_, _, ts, id) = key.value();
                                        Ok((ts, id))
                                    },
                                ),
                                bound,
                                &mut deadline,
                                &mut candidates,
                            )?;
                        }
                    }
                }
                None => {
                    // Kind-spanning prefix ranges interleave timestamps, so
                    // time bounds are verified later rather than encoded.
                    for author in authors {
                        let min = (*author, Kind::new(0), Timestamp::ZERO, EventId::ZERO);
                        let max_key =
                            (*author, Kind::new(u16::MAX), Timestamp::MAX, EventId::MAX);
                        take_ranked(
                            by_author_kind_tbl.range(&min..=&max_key)?.rev().map(|entry| {
                                let (key, _) = entry?;
                                let (_, _, ts, id) = key.value();
                                Ok((ts, id))
                            }),
                            None,
                            &mut deadline,
                            &mut candidates,
                        )?;
                    }
                }
            }
        } else if let Some(kinds) = &filter.kinds {
            let by_kind_tbl = tx.open_table(&events_by_kind::TABLE)?;
            for kind in kinds {
                let min = (*kind, since, EventId::ZERO);
                let max_key = (*kind, until, EventId::MAX);
                take_ranked(
                    by_kind_tbl.range(&min..=&max_key)?.rev().map(|entry| {
                        let (key, _) = entry?;
                        let (_, ts, id) = key.value();
                        Ok((ts, id))
                    }),
                    bound,
                    &mut deadline,
                    &mut candidates,
                )?;
            }
        } else if let Some((name, values)) = filter.tags.iter().next() {
            let indexable = values.iter().all(|value| value.len() <= MAX_INDEXED_TAG_VALUE);
            if indexable {
                let by_tag_tbl = tx.open_table(&events_by_tag::TABLE)?;
                let single_condition = filter.tags.len() == 1 && filter.search.is_none();
                let tag_bound = single_condition.then_some(limit);
                for value in values {
                    let min = (name.to_string(), value.clone(), since, EventId::ZERO);
                    let max_key = (name.to_string(), value.clone(), until, EventId::MAX);
                    take_ranked(
                        by_tag_tbl.range(&min..=&max_key)?.rev().map(|entry| {
                            let (key, _) = entry?;
                            let (_, _, ts, id) = key.value();
                            Ok((ts, id))
                        }),
                        tag_bound,
                        &mut deadline,
                        &mut candidates,
                    )?;
                }
            } else {
                return Self::time_scan_tx(tx, filter, since, until, limit, &events_tbl, deadline);
            }
        } else {
            return Self::time_scan_tx(tx, filter, since, until, limit, &events_tbl, deadline);
        }

        candidates.sort_by(rank_pair);

        let mut seen: HashSet<EventId> = HashSet::new();
        let mut results: Vec<Event> = vec![];
        for (_, id) in candidates {
            deadline.tick()?;
            if results.len() == limit {
                break;
            }
            if !seen.insert(id) {
                continue;
            }
            let Some(record) = Self::get_event_tx(id, &events_tbl)? else {
                continue;
            };
            if filter.matches(&record.event) {
                results.push(record.event);
            }
        }

        Ok(results)
    }

    /// Fallback plan: walk the global time index newest-first, verifying
    /// every event against the filter. Stops after `limit` matches, finishing
    /// the boundary second first so in-second id ordering stays correct.
    #[allow(clippy::too_many_arguments)]
    fn time_scan_tx(
        tx: &ReadTransaction,
        filter: &Filter,
        since: Timestamp,
        until: Timestamp,
        limit: usize,
        events_tbl: &impl events::ReadableTable,
        mut deadline: Deadline,
    ) -> StoreResult<Vec<Event>> {
        let by_time_tbl = tx.open_table(&events_by_time::TABLE)?;
        let min = (since, EventId::ZERO);
        let max_key = (until, EventId::MAX);

        let mut results: Vec<Event> = vec![];
        let mut boundary: Option<Timestamp> = None;
        for entry in by_time_tbl.range(&min..=&max_key)?.rev() {
            let (key, _) = entry?;
            let (ts, id) = key.value();
            deadline.tick()?;
            if let Some(boundary) = boundary {
                if ts < boundary {
                    break;
                }
            }
            let Some(record) = Self::get_event_tx(id, events_tbl)? else {
                continue;
            };
            if !filter.matches(&record.event) {
                continue;
            }
            results.push(record.event);
            if boundary.is_none() && limit <= results.len() {
                boundary = Some(ts);
            }
        }

        results.sort_by(rank);
        results.truncate(limit);
        Ok(results)
    }
}

use std::collections::HashSet;
use std::ops::ControlFlow;

use purplepages_core::{Event, EventId, Filter, Timestamp};

use crate::{EventStore, HllSketch, StoreResult};

/// Default page size for backward scans.
pub const DEFAULT_SCAN_PAGE: usize = 500;

/// Backward pagination through query results, exactly-once.
///
/// Pages move backward through time via `until` cursors. A page boundary
/// that falls mid-second re-queries that second exhaustively with a seen-set,
/// so rows sharing a timestamp across a page split are visited exactly once.
/// Batches preserve the global delivery order (`created_at` descending, id
/// ascending).
pub struct ScanPages<'s> {
    store: &'s EventStore,
    filter: Filter,
    page_size: usize,
    cursor: Timestamp,
    remaining: Option<usize>,
    done: bool,
}

impl<'s> ScanPages<'s> {
    pub fn new(store: &'s EventStore, filter: Filter, page_size: usize) -> Self {
        let cursor = filter.until.unwrap_or(Timestamp::MAX);
        let remaining = filter.limit;
        let mut filter = filter;
        filter.limit = None;
        Self {
            store,
            filter,
            page_size: page_size.max(1),
            cursor,
            remaining,
            done: false,
        }
    }

    pub async fn next_batch(&mut self) -> StoreResult<Option<Vec<Event>>> {
        if self.done || self.remaining == Some(0) {
            return Ok(None);
        }

        let mut page_filter = self.filter.clone();
        page_filter.until = Some(self.cursor);

        let page_size = self.page_size;
        let page = self
            .store
            .read_with(|tx| EventStore::query_tx(tx, &page_filter, page_size))
            .await?;

        let mut batch = if page.len() < self.page_size {
            self.done = true;
            page
        } else {
            let boundary = page
                .last()
                .expect("Can't fail: full page is non-empty")
                .created_at;

            let mut seen: HashSet<EventId> = page
                .iter()
                .filter(|event| event.created_at == boundary)
                .map(|event| event.id)
                .collect();
            let mut batch = page;

            // Exhaust the boundary second so a row landing on the split is
            // not skipped by the next page's `until = boundary - 1`.
            let mut second_filter = self.filter.clone();
            second_filter.since = Some(boundary);
            second_filter.until = Some(boundary);
            let second = self
                .store
                .read_with(|tx| EventStore::query_tx(tx, &second_filter, usize::MAX))
                .await?;
            for event in second {
                if seen.insert(event.id) {
                    batch.push(event);
                }
            }

            if boundary == Timestamp::ZERO
                || self.filter.since.is_some_and(|since| boundary <= since)
            {
                self.done = true;
            } else {
                self.cursor = boundary.saturating_sub(1);
            }
            batch
        };

        if let Some(remaining) = &mut self.remaining {
            if *remaining <= batch.len() {
                batch.truncate(*remaining);
                *remaining = 0;
                self.done = true;
            } else {
                *remaining -= batch.len();
            }
        }

        if batch.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

impl EventStore {
    /// Visit every event matching `filter` exactly once, newest-first,
    /// paging backward through time. The callback can stop the scan early.
    ///
    /// Returns the number of events visited.
    pub async fn scan(
        &self,
        filter: &Filter,
        page_size: usize,
        mut f: impl FnMut(Event) -> ControlFlow<()>,
    ) -> StoreResult<u64> {
        let mut pages = ScanPages::new(self, filter.clone(), page_size);
        let mut visited = 0u64;
        while let Some(batch) = pages.next_batch().await? {
            for event in batch {
                visited += 1;
                if let ControlFlow::Break(()) = f(event) {
                    return Ok(visited);
                }
            }
        }
        Ok(visited)
    }

    /// Number of events matching `filter`, clamped at `u32::MAX`.
    pub async fn count(&self, filter: &Filter) -> StoreResult<u32> {
        let visited = self.scan(filter, DEFAULT_SCAN_PAGE, |_| ControlFlow::Continue(())).await?;
        Ok(u32::try_from(visited).unwrap_or(u32::MAX))
    }

    /// Count matches and sketch the approximate number of distinct authors.
    ///
    /// Each matching event's author key is fed into a 256-register
    /// HyperLogLog at the given byte offset.
    pub async fn count_hll(
        &self,
        filter: &Filter,
        offset: usize,
    ) -> StoreResult<(u32, HllSketch)> {
        let mut sketch = HllSketch::new();
        let visited = self
            .scan(filter, DEFAULT_SCAN_PAGE, |event| {
                sketch.add(&event.pubkey, offset);
                ControlFlow::Continue(())
            })
            .await?;
        Ok((u32::try_from(visited).unwrap_or(u32::MAX), sketch))
    }
}

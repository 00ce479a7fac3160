use purplepages_core::{Event, EventId, Kind, Pubkey, Timestamp};
use tracing::{debug, info};

use crate::{
    event_history, events, events_by_author_kind, events_by_kind, events_by_tag, events_by_time,
    EventRecord, EventStore, StoreResult, WriteTransactionCtx, LOG_TARGET, MAX_INDEXED_TAG_VALUE,
};

/// Result of a [`EventStore::save`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The event was persisted (possibly replacing an older instance).
    Saved,
    /// An event with the same id already exists; nothing changed.
    Duplicate,
    /// A strictly newer instance occupies the event's replacement slot;
    /// the incoming event was dropped as a no-op.
    Superseded,
}

impl SaveOutcome {
    pub fn is_saved(self) -> bool {
        matches!(self, SaveOutcome::Saved)
    }
}

impl EventStore {
    pub(crate) fn save_tx(
        &self,
        event: &Event,
        received_at: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> StoreResult<SaveOutcome> {
        {
            let events_tbl = tx.open_table(&events::TABLE)?;
            if events_tbl.get(&event.id)?.is_some() {
                return Ok(SaveOutcome::Duplicate);
            }
        }

        if !event.kind.is_regular() {
            // Replaceable slot: the incoming event either loses against a
            // strictly newer occupant or evicts every older one.
            let candidates = Self::replacement_candidates_tx(tx, event)?;

            for candidate in &candidates {
                if candidate.supersedes(event) {
                    debug!(
                        target: LOG_TARGET,
                        event_id = %event.id,
                        existing = %candidate.id,
                        "Dropping superseded event"
                    );
                    return Ok(SaveOutcome::Superseded);
                }
            }

            for candidate in candidates {
                Self::remove_event_tx(candidate.id, tx)?;
                if candidate.kind == Kind::CONTACTS && self.archive_enabled() {
                    let mut history_tbl = tx.open_table(&event_history::TABLE)?;
                    history_tbl.insert(
                        &(
                            candidate.pubkey,
                            candidate.kind,
                            candidate.created_at,
                            candidate.id,
                        ),
                        &EventRecord {
                            event: candidate,
                            received_at,
                        },
                    )?;
                }
            }
        }

        Self::insert_event_tx(event, received_at, tx)?;

        info!(
            target: LOG_TARGET,
            kind = %event.kind,
            event_id = %event.id,
            author = %event.pubkey,
            "New event saved"
        );

        tx.on_commit({
            let saved_tx = self.saved_tx.clone();
            let event = event.clone();
            move || {
                let _ = saved_tx.send(event);
            }
        });

        Ok(SaveOutcome::Saved)
    }

    /// Events currently occupying the incoming event's replacement slot.
    ///
    /// For addressable kinds the slot additionally keys on the `d` tag.
    fn replacement_candidates_tx(
        tx: &WriteTransactionCtx,
        event: &Event,
    ) -> StoreResult<Vec<Event>> {
        let by_author_kind_tbl = tx.open_table(&events_by_author_kind::TABLE)?;
        let events_tbl = tx.open_table(&events::TABLE)?;

        let min = (event.pubkey, event.kind, Timestamp::ZERO, EventId::ZERO);
        let max = (event.pubkey, event.kind, Timestamp::MAX, EventId::MAX);

        let mut candidates = vec![];
        for entry in by_author_kind_tbl.range(&min..=&max)? {
            let (key, _) = entry?;
            let (_, _, _, event_id) = key.value();
            let Some(record) = Self::get_event_tx(event_id, &events_tbl)? else {
                continue;
            };
            let candidate = record.event;
            if event.kind.is_addressable() && candidate.d_tag() != event.d_tag() {
                continue;
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    fn insert_event_tx(
        event: &Event,
        received_at: Timestamp,
        tx: &WriteTransactionCtx,
    ) -> StoreResult<()> {
        let mut events_tbl = tx.open_table(&events::TABLE)?;
        let mut by_time_tbl = tx.open_table(&events_by_time::TABLE)?;
        let mut by_author_kind_tbl = tx.open_table(&events_by_author_kind::TABLE)?;
        let mut by_kind_tbl = tx.open_table(&events_by_kind::TABLE)?;
        let mut by_tag_tbl = tx.open_table(&events_by_tag::TABLE)?;

        events_tbl.insert(
            &event.id,
            &EventRecord {
                event: event.clone(),
                received_at,
            },
        )?;
        by_time_tbl.insert(&(event.created_at, event.id), &())?;
        by_author_kind_tbl.insert(
            &(event.pubkey, event.kind, event.created_at, event.id),
            &(),
        )?;
        by_kind_tbl.insert(&(event.kind, event.created_at, event.id), &())?;

        for (name, value) in Self::indexable_tags(event) {
            by_tag_tbl.insert(&(name, value, event.created_at, event.id), &())?;
        }

        Ok(())
    }

    pub(crate) fn remove_event_tx(
        event_id: EventId,
        tx: &WriteTransactionCtx,
    ) -> StoreResult<bool> {
        let mut events_tbl = tx.open_table(&events::TABLE)?;
        let Some(record) = events_tbl.remove(&event_id)?.map(|guard| guard.value()) else {
            return Ok(false);
        };
        let event = record.event;

        let mut by_time_tbl = tx.open_table(&events_by_time::TABLE)?;
        let mut by_author_kind_tbl = tx.open_table(&events_by_author_kind::TABLE)?;
        let mut by_kind_tbl = tx.open_table(&events_by_kind::TABLE)?;
        let mut by_tag_tbl = tx.open_table(&events_by_tag::TABLE)?;

        by_time_tbl.remove(&(event.created_at, event.id))?;
        by_author_kind_tbl.remove(&(event.pubkey, event.kind, event.created_at, event.id))?;
        by_kind_tbl.remove(&(event.kind, event.created_at, event.id))?;
        for (name, value) in Self::indexable_tags(&event) {
            by_tag_tbl.remove(&(name, value, event.created_at, event.id))?;
        }

        Ok(true)
    }

    pub(crate) fn delete_tx(event_id: EventId, tx: &WriteTransactionCtx) -> StoreResult<bool> {
        Self::remove_event_tx(event_id, tx)
    }

    pub(crate) fn delete_by_author_tx(
        author: Pubkey,
        tx: &WriteTransactionCtx,
    ) -> StoreResult<u64> {
        let ids: Vec<EventId> = {
            let by_author_kind_tbl = tx.open_table(&events_by_author_kind::TABLE)?;
            let min = (author, Kind::new(0), Timestamp::ZERO, EventId::ZERO);
            let max = (author, Kind::new(u16::MAX), Timestamp::MAX, EventId::MAX);
            let mut ids = vec![];
            for entry in by_author_kind_tbl.range(&min..=&max)? {
                let (key, _) = entry?;
                let (_, _, _, event_id) = key.value();
                ids.push(event_id);
            }
            ids
        };

        let mut deleted = 0;
        for event_id in ids {
            if Self::remove_event_tx(event_id, tx)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// The `(name, value)` pairs an event contributes to the tag index:
    /// single-letter tag names with values short enough to index.
    fn indexable_tags(event: &Event) -> impl Iterator<Item = (String, String)> + '_ {
        event.tags.iter().filter_map(|tag| {
            let name = tag.name_char()?;
            let value = tag.value()?;
            if MAX_INDEXED_TAG_VALUE < value.len() {
                return None;
            }
            Some((name.to_string(), value.to_owned()))
        })
    }
}

//! Table definitions for the event store.
//!
//! The `events` table is the authoritative record, keyed by event id.
//! Everything else is an index over it: insertions and deletions must touch
//! every index in the same transaction, and `save_ops` is the only module
//! that writes them.

use bincode::{Decode, Encode};
use purplepages_core::{Event, EventId, Kind, Pubkey, Timestamp};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// Tracks database/schema version.
    db_version: () => u64
}

def_table! {
    /// Main event storage, keyed by the 32-byte event id.
    ///
    /// One row per accepted event; replaceable kinds keep at most one row
    /// per slot because `save` deletes the superseded row in the same
    /// transaction.
    events: EventId => EventRecord
}

def_table! {
    /// Global time index.
    ///
    /// Key: (created_at, event_id). Reverse iteration yields newest-first
    /// with ids ascending inside one second after the query sort.
    events_by_time: (Timestamp, EventId) => ()
}

def_table! {
    /// Author+kind index; the workhorse for `{authors, kinds}` filters and
    /// for replacement-candidate lookup.
    events_by_author_kind: (Pubkey, Kind, Timestamp, EventId) => ()
}

def_table! {
    /// Kind index for author-less kind queries.
    events_by_kind: (Kind, Timestamp, EventId) => ()
}

def_table! {
    /// Tag index over single-letter tag names.
    ///
    /// Key: (tag_name, tag_value, created_at, event_id). Values longer than
    /// [`MAX_INDEXED_TAG_VALUE`] bytes are not indexed (a filter on such a
    /// value falls back to a time scan).
    events_by_tag: (String, String, Timestamp, EventId) => ()
}

def_table! {
    /// Superseded contact-list archive, written only when archiving is
    /// enabled. Follower-trend analytics read day-over-day diffs; everything
    /// else ignores this table.
    event_history: (Pubkey, Kind, Timestamp, EventId) => EventRecord
}

/// Longest tag value the tag index will carry.
pub const MAX_INDEXED_TAG_VALUE: usize = 255;

/// A stored event plus local bookkeeping.
#[derive(Debug, Encode, Decode, Clone)]
pub struct EventRecord {
    pub event: Event,
    /// When this relay first accepted the event.
    pub received_at: Timestamp,
}

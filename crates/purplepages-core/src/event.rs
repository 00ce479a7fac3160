use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{EventId, Kind, Pubkey, Sig, Timestamp};

/// A single event tag: an ordered tuple of strings where the first element
/// is the tag name (`"p"`, `"r"`, `"t"`, `"d"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Single-character tag name, the only form tag filters can address.
    pub fn name_char(&self) -> Option<char> {
        let name = self.name()?;
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Third tuple element; relay lists use it as the "read"/"write" marker.
    pub fn marker(&self) -> Option<&str> {
        self.0.get(2).map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for Tag {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

/// The replacement key of an event, derived from its kind class.
///
/// Two events with equal addresses compete for the same storage slot;
/// [`Event::supersedes`] decides the winner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Regular(EventId),
    Replaceable(Pubkey, Kind),
    Addressable(Pubkey, Kind, String),
}

/// A signed event: the atomic, immutable unit of the protocol.
///
/// Identity and signature validity are the wire codec's responsibility;
/// everything that reaches this type is assumed checked.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: Pubkey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: Sig,
}

impl Event {
    pub fn address(&self) -> Address {
        if self.kind.is_addressable() {
            Address::Addressable(
                self.pubkey,
                self.kind,
                self.d_tag().unwrap_or_default().to_owned(),
            )
        } else if self.kind.is_replaceable() {
            Address::Replaceable(self.pubkey, self.kind)
        } else {
            Address::Regular(self.id)
        }
    }

    /// The `d` tag value identifying an addressable event's slot.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.name() == Some("d"))
            .and_then(Tag::value)
    }

    /// Values of every tag named `name`, in tag order.
    pub fn tag_values<'e>(&'e self, name: &'e str) -> impl Iterator<Item = &'e str> + 'e {
        self.tags
            .iter()
            .filter(move |tag| tag.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Newer-wins replacement ordering: later `created_at` wins; on a
    /// timestamp tie the lexicographically smaller id is retained.
    ///
    /// Every replacement code path must route through this single
    /// comparison so ties break identically everywhere.
    pub fn supersedes(&self, other: &Event) -> bool {
        match self.created_at.cmp(&other.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.id < other.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id_byte: u8, created_at: u64, kind: u16, tags: Vec<Tag>) -> Event {
        Event {
            id: EventId::from_bytes([id_byte; 32]),
            pubkey: Pubkey::from_bytes([0x11; 32]),
            created_at: Timestamp::from_secs(created_at),
            kind: Kind::new(kind),
            tags,
            content: String::new(),
            sig: Sig::ZERO,
        }
    }

    #[test]
    fn supersedes_newer_wins() {
        let old = event(0xaa, 100, 0, vec![]);
        let new = event(0xbb, 101, 0, vec![]);
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
    }

    #[test]
    fn supersedes_tie_smaller_id_wins() {
        let a = event(0xaa, 100, 0, vec![]);
        let b = event(0xbb, 100, 0, vec![]);
        assert!(a.supersedes(&b));
        assert!(!b.supersedes(&a));
        // equal ids never supersede each other
        assert!(!a.supersedes(&a.clone()));
    }

    #[test]
    fn address_classes() {
        let profile = event(0xaa, 1, 0, vec![]);
        assert_eq!(
            profile.address(),
            Address::Replaceable(profile.pubkey, Kind::PROFILE)
        );

        let note = event(0xbb, 1, 1, vec![]);
        assert_eq!(note.address(), Address::Regular(note.id));

        let set = event(0xcc, 1, 30000, vec![Tag::new(["d", "x"])]);
        assert_eq!(
            set.address(),
            Address::Addressable(set.pubkey, Kind::FOLLOW_SETS, "x".to_owned())
        );

        // missing d-tag collapses to the empty slot
        let bare = event(0xdd, 1, 30000, vec![]);
        assert_eq!(
            bare.address(),
            Address::Addressable(bare.pubkey, Kind::FOLLOW_SETS, String::new())
        );
    }

    #[test]
    fn tag_accessors() {
        let ev = event(
            0xaa,
            1,
            10002,
            vec![
                Tag::new(["r", "wss://relay.example.com", "read"]),
                Tag::new(["r", "wss://other.example.com"]),
                Tag::new(["t", "nostr"]),
            ],
        );
        let relays: Vec<&str> = ev.tag_values("r").collect();
        assert_eq!(
            relays,
            vec!["wss://relay.example.com", "wss://other.example.com"]
        );
        assert_eq!(ev.tags[0].marker(), Some("read"));
        assert_eq!(ev.tags[1].marker(), None);
        assert_eq!(ev.tags[2].name_char(), Some('t'));
    }

    #[test]
    fn serde_wire_shape() {
        let ev = event(0x01, 42, 3, vec![Tag::new(["p", "abcd"])]);
        let json = serde_json::to_value(&ev).expect("serializes");
        assert_eq!(json["kind"], 3);
        assert_eq!(json["created_at"], 42);
        assert_eq!(json["tags"][0][0], "p");
        let back: Event = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, ev);
    }
}

use std::collections::BTreeSet;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Event kind: an integer classifying an event's semantics.
///
/// The kind decides the replacement policy applied on save:
///
/// - *Regular* kinds are unique by event id.
/// - *Replaceable* kinds (0, 3 and 10000..=19999) keep at most one event per
///   `(pubkey, kind)`, newest wins.
/// - *Addressable* kinds (30000..=39999) keep at most one event per
///   `(pubkey, kind, d-tag)`, newest wins.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Kind(u16);

impl Kind {
    /// User metadata (NIP-01).
    pub const PROFILE: Self = Self(0);
    /// Contact list / follows (NIP-02).
    pub const CONTACTS: Self = Self(3);
    /// Mute list (NIP-51).
    pub const MUTE_LIST: Self = Self(10000);
    /// Pinned notes (NIP-51).
    pub const PIN_LIST: Self = Self(10001);
    /// Relay list metadata (NIP-65); drives peer discovery.
    pub const RELAY_LIST: Self = Self(10002);
    /// Bookmarks (NIP-51).
    pub const BOOKMARKS: Self = Self(10003);
    /// Communities list (NIP-51).
    pub const COMMUNITIES: Self = Self(10004);
    /// Public chats list (NIP-51).
    pub const PUBLIC_CHATS: Self = Self(10005);
    /// Blocked relays (NIP-51).
    pub const BLOCKED_RELAYS: Self = Self(10006);
    /// Search relays (NIP-51).
    pub const SEARCH_RELAYS: Self = Self(10007);
    /// Interests list (NIP-51); drives the top-interests cache.
    pub const INTERESTS: Self = Self(10015);
    /// Follow sets (NIP-51, addressable).
    pub const FOLLOW_SETS: Self = Self(30000);
    /// Relay sets (NIP-51, addressable).
    pub const RELAY_SETS: Self = Self(30002);
    /// Bookmark sets (NIP-51, addressable).
    pub const BOOKMARK_SETS: Self = Self(30003);
    /// Interest sets (NIP-51, addressable).
    pub const INTEREST_SETS: Self = Self(30015);
    /// User emoji sets (NIP-51, addressable).
    pub const EMOJI_SETS: Self = Self(30030);

    pub const fn new(kind: u16) -> Self {
        Self(kind)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub const fn is_replaceable(self) -> bool {
        matches!(self.0, 0 | 3) || (10000 <= self.0 && self.0 <= 19999)
    }

    pub const fn is_addressable(self) -> bool {
        30000 <= self.0 && self.0 <= 39999
    }

    pub const fn is_regular(self) -> bool {
        !self.is_replaceable() && !self.is_addressable()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Kind {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u16> for Kind {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// The identity-like kinds this relay accepts by default.
pub const DEFAULT_ALLOWED_KINDS: &[Kind] = &[
    Kind::PROFILE,
    Kind::CONTACTS,
    Kind::MUTE_LIST,
    Kind::PIN_LIST,
    Kind::RELAY_LIST,
    Kind::BOOKMARKS,
    Kind::COMMUNITIES,
    Kind::PUBLIC_CHATS,
    Kind::BLOCKED_RELAYS,
    Kind::SEARCH_RELAYS,
    Kind::INTERESTS,
    Kind::FOLLOW_SETS,
    Kind::RELAY_SETS,
    Kind::BOOKMARK_SETS,
    Kind::INTEREST_SETS,
    Kind::EMOJI_SETS,
];

/// The kinds the replication workers pull from peers by default.
pub const DEFAULT_SYNC_KINDS: &[Kind] = &[Kind::PROFILE, Kind::CONTACTS, Kind::RELAY_LIST];

/// An ordered set of kinds, parsed from comma-separated configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindSet(BTreeSet<Kind>);

impl KindSet {
    pub fn default_allowed() -> Self {
        DEFAULT_ALLOWED_KINDS.iter().copied().collect()
    }

    pub fn default_sync() -> Self {
        DEFAULT_SYNC_KINDS.iter().copied().collect()
    }

    pub fn contains(&self, kind: Kind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Kind> + '_ {
        self.0.iter().copied()
    }

    pub fn insert(&mut self, kind: Kind) -> bool {
        self.0.insert(kind)
    }
}

impl FromIterator<Kind> for KindSet {
    fn from_iter<T: IntoIterator<Item = Kind>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for KindSet {
    type Item = Kind;
    type IntoIter = std::collections::btree_set::IntoIter<Kind>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromStr for KindSet {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Kind::from_str)
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

impl fmt::Display for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for kind in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            kind.fmt(f)?;
            first = false;
        }
        Ok(())
    }
}

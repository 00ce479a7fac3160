use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Event, EventId, Kind, Pubkey, Timestamp};

/// A query filter in the NIP-01 shape.
///
/// Absent fields are wildcards; the default filter matches every event.
/// Tag conditions are keyed by single-letter tag name and serialized as
/// `"#p": [...]` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<EventId>>,
    pub authors: Option<BTreeSet<Pubkey>>,
    pub kinds: Option<BTreeSet<Kind>>,
    pub tags: BTreeMap<char, BTreeSet<String>>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if until < event.created_at {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let hit = event.tags.iter().any(|tag| {
                tag.name_char() == Some(*key)
                    && tag.value().is_some_and(|value| values.contains(value))
            });
            if !hit {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !event.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }

    /// True when every field is a wildcard (matches all events).
    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }

    /// Restrict the filter's kinds to `keep`, returning the kinds dropped.
    ///
    /// With no kind condition at all the filter is widened to exactly
    /// `keep` (the relay never serves outside its whitelist).
    pub fn intersect_kinds(&mut self, keep: &BTreeSet<Kind>) -> Vec<Kind> {
        match &mut self.kinds {
            Some(kinds) => {
                let dropped: Vec<Kind> =
                    kinds.iter().copied().filter(|k| !keep.contains(k)).collect();
                kinds.retain(|k| keep.contains(k));
                dropped
            }
            None => {
                self.kinds = Some(keep.clone());
                Vec::new()
            }
        }
    }
}

impl Serialize for Filter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (key, values) in &self.tags {
            map.serialize_entry(&format!("#{key}"), values)?;
        }
        if let Some(since) = &self.since {
            map.serialize_entry("since", since)?;
        }
        if let Some(until) = &self.until {
            map.serialize_entry("until", until)?;
        }
        if let Some(search) = &self.search {
            map.serialize_entry("search", search)?;
        }
        if let Some(limit) = &self.limit {
            map.serialize_entry("limit", limit)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = Filter;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a filter object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Filter, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut filter = Filter::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "ids" => filter.ids = Some(map.next_value()?),
                        "authors" => filter.authors = Some(map.next_value()?),
                        "kinds" => filter.kinds = Some(map.next_value()?),
                        "since" => filter.since = Some(map.next_value()?),
                        "until" => filter.until = Some(map.next_value()?),
                        "search" => filter.search = Some(map.next_value()?),
                        "limit" => filter.limit = Some(map.next_value()?),
                        other => {
                            let tag_key = other.strip_prefix('#').and_then(|rest| {
                                let mut chars = rest.chars();
                                match (chars.next(), chars.next()) {
                                    (Some(c), None) => Some(c),
                                    _ => None,
                                }
                            });
                            match tag_key {
                                Some(c) => {
                                    filter.tags.insert(c, map.next_value()?);
                                }
                                // unknown fields are ignored, per NIP-01
                                None => {
                                    map.next_value::<IgnoredAny>()?;
                                }
                            }
                        }
                    }
                }
                Ok(filter)
            }
        }

        deserializer.deserialize_map(FilterVisitor)
    }
}

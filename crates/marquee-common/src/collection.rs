//! Per-profile collection records: watchlist membership and watch history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Identity, ItemId, ProfileId};

/// Which collection an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Watchlist,
    History,
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Watchlist => f.write_str("watchlist"),
            CollectionKind::History => f.write_str("history"),
        }
    }
}

/// Watchlist membership. `added_at` only orders the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchlistEntry {
    pub item_id: ItemId,
    pub added_at: DateTime<Utc>,
}

impl WatchlistEntry {
    pub fn new(item_id: ItemId, added_at: DateTime<Utc>) -> Self {
        Self { item_id, added_at }
    }
}

/// Playback progress for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub item_id: ItemId,
    /// Playback position in seconds.
    pub progress: u64,
    pub last_watched_at: DateTime<Utc>,
    /// Runtime in seconds, when the catalog reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl HistoryEntry {
    pub fn new(item_id: ItemId, progress: u64, last_watched_at: DateTime<Utc>) -> Self {
        Self {
            item_id,
            progress,
            last_watched_at,
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// A record as written to the collection store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectionEntry {
    Watchlist(WatchlistEntry),
    History(HistoryEntry),
}

impl CollectionEntry {
    pub fn kind(&self) -> CollectionKind {
        match self {
            CollectionEntry::Watchlist(_) => CollectionKind::Watchlist,
            CollectionEntry::History(_) => CollectionKind::History,
        }
    }

    pub fn item_id(&self) -> ItemId {
        match self {
            CollectionEntry::Watchlist(e) => e.item_id,
            CollectionEntry::History(e) => e.item_id,
        }
    }
}

/// Fully qualified key of a collection record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub identity: Identity,
    pub profile: ProfileId,
    pub item: ItemId,
}

impl EntryKey {
    pub fn new(identity: Identity, profile: ProfileId, item: ItemId) -> Self {
        Self {
            identity,
            profile,
            item,
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.identity, self.profile, self.item)
    }
}

/// The collection state held by both mirror and remote after a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergedState {
    /// Ordered by `added_at`, oldest first.
    pub watchlist: Vec<WatchlistEntry>,
    /// Ordered by `last_watched_at`, most recent first.
    pub history: Vec<HistoryEntry>,
}

impl ConvergedState {
    pub fn watchlist_items(&self) -> Vec<ItemId> {
        self.watchlist.iter().map(|e| e.item_id).collect()
    }

    pub fn history_for(&self, item: ItemId) -> Option<&HistoryEntry> {
        self.history.iter().find(|e| e.item_id == item)
    }
}

/// Sort helpers shared by the mirror and the stores so both present the
/// same ordering.
pub fn sort_watchlist(entries: &mut [WatchlistEntry]) {
    entries.sort_by(|a, b| {
        a.added_at
            .cmp(&b.added_at)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
}

pub fn sort_history(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| {
        b.last_watched_at
            .cmp(&a.last_watched_at)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_history_sorted_most_recent_first() {
        let mut entries = vec![
            HistoryEntry::new(ItemId(1), 10, at(100)),
            HistoryEntry::new(ItemId(2), 10, at(300)),
            HistoryEntry::new(ItemId(3), 10, at(200)),
        ];
        sort_history(&mut entries);
        let ids: Vec<u64> = entries.iter().map(|e| e.item_id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_watchlist_sorted_by_insertion() {
        let mut entries = vec![
            WatchlistEntry::new(ItemId(9), at(50)),
            WatchlistEntry::new(ItemId(3), at(10)),
        ];
        sort_watchlist(&mut entries);
        assert_eq!(entries[0].item_id, ItemId(3));
    }

    #[test]
    fn test_collection_entry_tagged_json() {
        let entry = CollectionEntry::History(HistoryEntry::new(ItemId(5), 40, at(1)).with_duration(90));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "history");
        assert_eq!(json["itemId"], 5);
        assert_eq!(json["duration"], 90);
        assert_eq!(entry.kind(), CollectionKind::History);
    }
}

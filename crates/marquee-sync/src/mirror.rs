//! Device-local collection cache.
//!
//! Every entry is tagged with where it came from and whether the remote
//! store has acknowledged it. Local mutations bump a revision so a sync pass
//! that started earlier never overwrites them.

use chrono::{DateTime, Utc};
use marquee_common::collection::{sort_history, sort_watchlist};
use marquee_common::{CollectionKind, HistoryEntry, ItemId, ProfileId, WatchlistEntry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState<T> {
    Present(T),
    /// Tombstone for a removal the remote store may not have seen yet.
    Removed { removed_at: DateTime<Utc> },
}

/// A mirror entry together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracked<T> {
    pub item_id: ItemId,
    pub state: EntryState<T>,
    pub origin: Origin,
    pub pending_sync: bool,
    #[serde(default)]
    pub revision: u64,
}

impl<T> Tracked<T> {
    pub fn value(&self) -> Option<&T> {
        match &self.state {
            EntryState::Present(v) => Some(v),
            EntryState::Removed { .. } => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.state, EntryState::Removed { .. })
    }

    fn local(item_id: ItemId, state: EntryState<T>, revision: u64) -> Self {
        Self {
            item_id,
            state,
            origin: Origin::Local,
            pending_sync: true,
            revision,
        }
    }
}

/// All mirror entries for one profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileMirror {
    pub watchlist: BTreeMap<ItemId, Tracked<WatchlistEntry>>,
    pub history: BTreeMap<ItemId, Tracked<HistoryEntry>>,
}

impl ProfileMirror {
    fn pending(&self) -> usize {
        self.watchlist.values().filter(|t| t.pending_sync).count()
            + self.history.values().filter(|t| t.pending_sync).count()
    }

    /// Index a snapshot by item. An entry whose value names a different
    /// item than its key, or an item listed twice, rejects the snapshot.
    fn from_snapshot(snapshot: MirrorSnapshot) -> Result<Self, SyncError> {
        let mut mirror = Self::default();
        for tracked in snapshot.watchlist {
            index_entry(&mut mirror.watchlist, tracked, CollectionKind::Watchlist, |e| e.item_id)?;
        }
        for tracked in snapshot.history {
            index_entry(&mut mirror.history, tracked, CollectionKind::History, |e| e.item_id)?;
        }
        Ok(mirror)
    }
}

fn index_entry<T>(
    map: &mut BTreeMap<ItemId, Tracked<T>>,
    tracked: Tracked<T>,
    kind: CollectionKind,
    item_of: impl Fn(&T) -> ItemId,
) -> Result<(), SyncError> {
    if let Some(inner) = tracked.value().map(&item_of) {
        if inner != tracked.item_id {
            return Err(SyncError::InvalidSnapshot(format!(
                "{} entry {} holds a value for item {}",
                kind, tracked.item_id, inner
            )));
        }
    }
    if map.contains_key(&tracked.item_id) {
        return Err(SyncError::InvalidSnapshot(format!(
            "{} item {} listed more than once",
            kind, tracked.item_id
        )));
    }
    map.insert(tracked.item_id, tracked);
    Ok(())
}

/// Serializable form of one profile's mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSnapshot {
    #[serde(default)]
    pub watchlist: Vec<Tracked<WatchlistEntry>>,
    #[serde(default)]
    pub history: Vec<Tracked<HistoryEntry>>,
}

impl From<&ProfileMirror> for MirrorSnapshot {
    fn from(m: &ProfileMirror) -> Self {
        Self {
            watchlist: m.watchlist.values().cloned().collect(),
            history: m.history.values().cloned().collect(),
        }
    }
}

const MIRROR_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MirrorFile {
    version: u32,
    profiles: Vec<(ProfileId, MirrorSnapshot)>,
}

/// What a sync pass decided for one mirror entry.
#[derive(Debug, Clone)]
pub(crate) enum Settlement<T> {
    /// The remote store holds this value; the entry is no longer pending.
    Present(T),
    /// The entry no longer exists on either side.
    Evict,
}

#[derive(Default)]
pub struct LocalMirror {
    profiles: RwLock<HashMap<ProfileId, ProfileMirror>>,
    revision: AtomicU64,
}

impl LocalMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mirror holding a single profile's entries, e.g. as submitted
    /// by a client over the wire.
    pub fn from_snapshot(profile: ProfileId, snapshot: MirrorSnapshot) -> Result<Self, SyncError> {
        let mirror = Self::new();
        mirror.replace_profile(profile, snapshot)?;
        Ok(mirror)
    }

    /// Install `snapshot` as the profile's entries. Incoming revisions are
    /// discarded and every entry is renumbered from this mirror's counter.
    pub fn replace_profile(&self, profile: ProfileId, snapshot: MirrorSnapshot) -> Result<(), SyncError> {
        let mut entries = ProfileMirror::from_snapshot(snapshot)?;
        for tracked in entries.watchlist.values_mut() {
            tracked.revision = self.next_revision();
        }
        for tracked in entries.history.values_mut() {
            tracked.revision = self.next_revision();
        }
        self.profiles.write().insert(profile, entries);
        Ok(())
    }

    fn next_revision(&self) -> u64 {
        let previous = self
            .revision
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| Some(r.saturating_add(1)))
            .unwrap_or_else(|r| r);
        previous.saturating_add(1)
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    pub fn stage_watchlist_add(&self, profile: &ProfileId, item: ItemId, at: DateTime<Utc>) -> u64 {
        let revision = self.next_revision();
        let mut profiles = self.profiles.write();
        let watchlist = &mut profiles.entry(profile.clone()).or_default().watchlist;
        match watchlist.get(&item) {
            Some(existing) if !existing.is_tombstone() => existing.revision,
            _ => {
                let entry = WatchlistEntry::new(item, at);
                watchlist.insert(item, Tracked::local(item, EntryState::Present(entry), revision));
                revision
            }
        }
    }

    pub fn stage_watchlist_remove(&self, profile: &ProfileId, item: ItemId, at: DateTime<Utc>) -> u64 {
        let revision = self.next_revision();
        let mut profiles = self.profiles.write();
        profiles.entry(profile.clone()).or_default().watchlist.insert(
            item,
            Tracked::local(item, EntryState::Removed { removed_at: at }, revision),
        );
        revision
    }

    pub fn stage_progress(&self, profile: &ProfileId, entry: HistoryEntry) -> u64 {
        let revision = self.next_revision();
        let item = entry.item_id;
        let mut profiles = self.profiles.write();
        profiles
            .entry(profile.clone())
            .or_default()
            .history
            .insert(item, Tracked::local(item, EntryState::Present(entry), revision));
        revision
    }

    pub fn stage_history_remove(&self, profile: &ProfileId, item: ItemId, at: DateTime<Utc>) -> u64 {
        let revision = self.next_revision();
        let mut profiles = self.profiles.write();
        profiles.entry(profile.clone()).or_default().history.insert(
            item,
            Tracked::local(item, EntryState::Removed { removed_at: at }, revision),
        );
        revision
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Visible watchlist, oldest addition first.
    pub fn watchlist(&self, profile: &ProfileId) -> Vec<WatchlistEntry> {
        let profiles = self.profiles.read();
        let mut entries: Vec<WatchlistEntry> = profiles
            .get(profile)
            .map(|m| m.watchlist.values().filter_map(|t| t.value().cloned()).collect())
            .unwrap_or_default();
        sort_watchlist(&mut entries);
        entries
    }

    /// Visible history, most recently watched first.
    pub fn history(&self, profile: &ProfileId) -> Vec<HistoryEntry> {
        let profiles = self.profiles.read();
        let mut entries: Vec<HistoryEntry> = profiles
            .get(profile)
            .map(|m| m.history.values().filter_map(|t| t.value().cloned()).collect())
            .unwrap_or_default();
        sort_history(&mut entries);
        entries
    }

    pub fn watchlist_entry(&self, profile: &ProfileId, item: ItemId) -> Option<Tracked<WatchlistEntry>> {
        self.profiles
            .read()
            .get(profile)
            .and_then(|m| m.watchlist.get(&item).cloned())
    }

    pub fn history_entry(&self, profile: &ProfileId, item: ItemId) -> Option<Tracked<HistoryEntry>> {
        self.profiles
            .read()
            .get(profile)
            .and_then(|m| m.history.get(&item).cloned())
    }

    pub fn pending(&self, profile: &ProfileId) -> usize {
        self.profiles
            .read()
            .get(profile)
            .map(ProfileMirror::pending)
            .unwrap_or(0)
    }

    pub fn has_pending(&self, profile: &ProfileId) -> bool {
        self.pending(profile) > 0
    }

    pub fn snapshot(&self, profile: &ProfileId) -> MirrorSnapshot {
        self.profiles
            .read()
            .get(profile)
            .map(MirrorSnapshot::from)
            .unwrap_or_default()
    }

    pub(crate) fn profile_entries(&self, profile: &ProfileId) -> ProfileMirror {
        self.profiles.read().get(profile).cloned().unwrap_or_default()
    }

    /// Forget everything, e.g. on sign-out.
    pub fn clear(&self) {
        self.profiles.write().clear();
    }

    // ------------------------------------------------------------------
    // Sync outcomes
    // ------------------------------------------------------------------

    /// Apply a watchlist outcome if the entry still has the revision the
    /// pass observed (`None` meaning it was absent). Returns whether it applied.
    pub(crate) fn settle_watchlist(
        &self,
        profile: &ProfileId,
        item: ItemId,
        observed: Option<u64>,
        outcome: Settlement<WatchlistEntry>,
    ) -> bool {
        let revision = self.next_revision();
        let mut profiles = self.profiles.write();
        let map = &mut profiles.entry(profile.clone()).or_default().watchlist;
        settle(map, item, observed, outcome, revision)
    }

    pub(crate) fn settle_history(
        &self,
        profile: &ProfileId,
        item: ItemId,
        observed: Option<u64>,
        outcome: Settlement<HistoryEntry>,
    ) -> bool {
        let revision = self.next_revision();
        let mut profiles = self.profiles.write();
        let map = &mut profiles.entry(profile.clone()).or_default().history;
        settle(map, item, observed, outcome, revision)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the whole mirror to `path` (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        let file = {
            let profiles = self.profiles.read();
            let mut list: Vec<(ProfileId, MirrorSnapshot)> = profiles
                .iter()
                .map(|(p, m)| (p.clone(), MirrorSnapshot::from(m)))
                .collect();
            list.sort_by(|a, b| a.0.cmp(&b.0));
            MirrorFile {
                version: MIRROR_FILE_VERSION,
                profiles: list,
            }
        };
        let data = serde_json::to_vec_pretty(&file)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!("mirror saved to {:?}", path);
        Ok(())
    }

    /// Load a mirror written by [`LocalMirror::save`]. A missing file is an
    /// empty mirror.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let mirror = Self::new();
        if !path.exists() {
            return Ok(mirror);
        }
        let data = std::fs::read(path)?;
        let file: MirrorFile = serde_json::from_slice(&data)?;
        if file.version != MIRROR_FILE_VERSION {
            return Err(SyncError::UnsupportedMirrorVersion(file.version));
        }
        for (profile, snapshot) in file.profiles {
            mirror.replace_profile(profile, snapshot)?;
        }
        Ok(mirror)
    }
}

fn settle<T>(
    map: &mut BTreeMap<ItemId, Tracked<T>>,
    item: ItemId,
    observed: Option<u64>,
    outcome: Settlement<T>,
    revision: u64,
) -> bool {
    let current = map.get(&item).map(|t| t.revision);
    if current != observed {
        return false;
    }
    match outcome {
        Settlement::Present(value) => {
            map.insert(
                item,
                Tracked {
                    item_id: item,
                    state: EntryState::Present(value),
                    origin: Origin::Remote,
                    pending_sync: false,
                    revision,
                },
            );
        }
        Settlement::Evict => {
            map.remove(&item);
        }
    }
    true
}

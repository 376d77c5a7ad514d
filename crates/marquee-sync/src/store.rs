//! Authoritative collection storage.

use async_trait::async_trait;
use dashmap::DashMap;
use marquee_common::collection::{sort_history, sort_watchlist};
use marquee_common::{
    CollectionEntry, CollectionKind, EntryKey, HistoryEntry, Identity, ItemId, ProfileId,
    StoreError, StoreResult, WatchlistEntry,
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub scopes: usize,
    pub watchlist_entries: usize,
    pub history_entries: usize,
}

/// The remote, authoritative side of every collection.
///
/// All reads are scoped to one `(identity, profile)` pair. `upsert` and
/// `remove` must be idempotent.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn get_watchlist(
        &self,
        identity: &Identity,
        profile: &ProfileId,
    ) -> StoreResult<Vec<WatchlistEntry>>;

    async fn get_history(
        &self,
        identity: &Identity,
        profile: &ProfileId,
    ) -> StoreResult<Vec<HistoryEntry>>;

    async fn upsert(&self, key: &EntryKey, entry: CollectionEntry) -> StoreResult<()>;

    async fn remove(&self, key: &EntryKey, kind: CollectionKind) -> StoreResult<()>;

    async fn stats(&self) -> StoreResult<Option<StoreStats>> {
        Ok(None)
    }
}

#[derive(Debug, Default)]
struct ScopeRecords {
    watchlist: BTreeMap<ItemId, WatchlistEntry>,
    history: BTreeMap<ItemId, HistoryEntry>,
}

/// Process-local store keyed by `(identity, profile)`.
#[derive(Default)]
pub struct InMemoryCollectionStore {
    scopes: DashMap<(Identity, ProfileId), ScopeRecords>,
}

impl InMemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_key(identity: &Identity, profile: &ProfileId) -> (Identity, ProfileId) {
        (identity.clone(), profile.clone())
    }
}

#[async_trait]
impl CollectionStore for InMemoryCollectionStore {
    async fn get_watchlist(
        &self,
        identity: &Identity,
        profile: &ProfileId,
    ) -> StoreResult<Vec<WatchlistEntry>> {
        let mut entries: Vec<WatchlistEntry> = self
            .scopes
            .get(&Self::scope_key(identity, profile))
            .map(|s| s.watchlist.values().cloned().collect())
            .unwrap_or_default();
        sort_watchlist(&mut entries);
        Ok(entries)
    }

    async fn get_history(
        &self,
        identity: &Identity,
        profile: &ProfileId,
    ) -> StoreResult<Vec<HistoryEntry>> {
        let mut entries: Vec<HistoryEntry> = self
            .scopes
            .get(&Self::scope_key(identity, profile))
            .map(|s| s.history.values().cloned().collect())
            .unwrap_or_default();
        sort_history(&mut entries);
        Ok(entries)
    }

    async fn upsert(&self, key: &EntryKey, entry: CollectionEntry) -> StoreResult<()> {
        if entry.item_id() != key.item {
            return Err(StoreError::Rejected(format!(
                "entry for item {} written under key {}",
                entry.item_id(),
                key
            )));
        }
        let mut scope = self
            .scopes
            .entry(Self::scope_key(&key.identity, &key.profile))
            .or_default();
        match entry {
            CollectionEntry::Watchlist(e) => {
                scope.watchlist.insert(key.item, e);
            }
            CollectionEntry::History(e) => {
                scope.history.insert(key.item, e);
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &EntryKey, kind: CollectionKind) -> StoreResult<()> {
        if let Some(mut scope) = self
            .scopes
            .get_mut(&Self::scope_key(&key.identity, &key.profile))
        {
            match kind {
                CollectionKind::Watchlist => {
                    scope.watchlist.remove(&key.item);
                }
                CollectionKind::History => {
                    scope.history.remove(&key.item);
                }
            }
        }
        Ok(())
    }

    async fn stats(&self) -> StoreResult<Option<StoreStats>> {
        let mut stats = StoreStats {
            scopes: self.scopes.len(),
            ..Default::default()
        };
        for scope in self.scopes.iter() {
            stats.watchlist_entries += scope.watchlist.len();
            stats.history_entries += scope.history.len();
        }
        Ok(Some(stats))
    }
}

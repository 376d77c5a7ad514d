//! Reconciles a local mirror with the collection store.
//!
//! One pass per `(identity, profile)` runs at a time; passes for different
//! keys run in parallel. Each entry's outcome is independent: a failed push
//! leaves that entry pending and the pass carries on.

use dashmap::DashMap;
use marquee_common::{
    CollectionEntry, CollectionKind, ConvergedState, EntryKey, HistoryEntry, Identity, ItemId,
    ProfileId, WatchlistEntry,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::merge::{merge_history, merge_watchlist, HistoryPlan, WatchlistPlan};
use crate::mirror::{LocalMirror, Settlement};
use crate::store::CollectionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    Push,
    Remove,
}

/// One entry that could not be written to the store during a pass. It stays
/// pending in the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSyncFailure {
    pub item: ItemId,
    pub kind: CollectionKind,
    pub op: SyncOp,
    pub reason: String,
}

/// History entries that tied on timestamp and progress; `kept` won on the
/// remaining fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub item: ItemId,
    pub kept: HistoryEntry,
    pub discarded: HistoryEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub converged: ConvergedState,
    pub pushed: usize,
    pub pulled: usize,
    pub removed: usize,
    pub failures: Vec<PartialSyncFailure>,
    pub conflicts: Vec<SyncConflict>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

type ScopeKey = (Identity, ProfileId);

pub struct Synchronizer {
    store: Arc<dyn CollectionStore>,
    locks: DashMap<ScopeKey, Arc<tokio::sync::Mutex<()>>>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn CollectionStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CollectionStore> {
        &self.store
    }

    fn lock_for(&self, key: &ScopeKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Merge `mirror`'s entries for `profile` with the store's copy for
    /// `(identity, profile)`.
    ///
    /// Fails only when the store cannot be read at all; the mirror is then
    /// left untouched.
    pub async fn sync(
        &self,
        identity: &Identity,
        profile: &ProfileId,
        mirror: &LocalMirror,
    ) -> Result<SyncReport> {
        let key: ScopeKey = (identity.clone(), profile.clone());
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.run_pass(identity, profile, mirror).await
        };
        drop(lock);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn run_pass(
        &self,
        identity: &Identity,
        profile: &ProfileId,
        mirror: &LocalMirror,
    ) -> Result<SyncReport> {
        let local = mirror.profile_entries(profile);
        let remote_watchlist: BTreeMap<ItemId, WatchlistEntry> = self
            .store
            .get_watchlist(identity, profile)
            .await
            .map_err(SyncError::StoreUnavailable)?
            .into_iter()
            .map(|e| (e.item_id, e))
            .collect();
        let remote_history: BTreeMap<ItemId, HistoryEntry> = self
            .store
            .get_history(identity, profile)
            .await
            .map_err(SyncError::StoreUnavailable)?
            .into_iter()
            .map(|e| (e.item_id, e))
            .collect();

        let mut report = SyncReport::default();

        let items: BTreeSet<ItemId> = local
            .watchlist
            .keys()
            .chain(remote_watchlist.keys())
            .copied()
            .collect();
        for item in items {
            let tracked = local.watchlist.get(&item);
            let observed = tracked.map(|t| t.revision);
            let plan = merge_watchlist(tracked, remote_watchlist.get(&item));
            let entry_key = EntryKey::new(identity.clone(), profile.clone(), item);
            self.apply_watchlist(&entry_key, mirror, observed, plan, &mut report)
                .await;
        }

        let items: BTreeSet<ItemId> = local
            .history
            .keys()
            .chain(remote_history.keys())
            .copied()
            .collect();
        for item in items {
            let tracked = local.history.get(&item);
            let observed = tracked.map(|t| t.revision);
            let remote = remote_history.get(&item);
            let (plan, resolution) = merge_history(tracked, remote);
            if let (Some(res), Some(local_value), Some(remote_value)) =
                (resolution, tracked.and_then(|t| t.value()), remote)
            {
                if res.conflict {
                    let (kept, discarded) = match &plan {
                        HistoryPlan::Push(_) => (local_value.clone(), remote_value.clone()),
                        _ => (remote_value.clone(), local_value.clone()),
                    };
                    warn!(item = %item, "history tie resolved by fallback ordering");
                    report.conflicts.push(SyncConflict {
                        item,
                        kept,
                        discarded,
                    });
                }
            }
            let entry_key = EntryKey::new(identity.clone(), profile.clone(), item);
            self.apply_history(&entry_key, mirror, observed, plan, &mut report)
                .await;
        }

        report.converged = ConvergedState {
            watchlist: mirror.watchlist(profile),
            history: mirror.history(profile),
        };

        if report.failures.is_empty() {
            info!(
                identity = %identity,
                profile = %profile,
                pushed = report.pushed,
                pulled = report.pulled,
                removed = report.removed,
                "sync pass converged"
            );
        } else {
            warn!(
                identity = %identity,
                profile = %profile,
                failed = report.failures.len(),
                "sync pass left entries pending"
            );
        }
        Ok(report)
    }

    async fn apply_watchlist(
        &self,
        key: &EntryKey,
        mirror: &LocalMirror,
        observed: Option<u64>,
        plan: WatchlistPlan,
        report: &mut SyncReport,
    ) {
        debug!(key = %key, ?plan, "watchlist merge");
        let settle = |outcome| {
            if !mirror.settle_watchlist(&key.profile, key.item, observed, outcome) {
                debug!(key = %key, "local change during pass, left pending");
            }
        };
        match plan {
            WatchlistPlan::Nothing => {}
            WatchlistPlan::Pull(entry) => {
                settle(Settlement::Present(entry));
                report.pulled += 1;
            }
            WatchlistPlan::Keep(entry) => settle(Settlement::Present(entry)),
            WatchlistPlan::DropLocal => settle(Settlement::Evict),
            WatchlistPlan::Push(entry) => {
                match self
                    .store
                    .upsert(key, CollectionEntry::Watchlist(entry.clone()))
                    .await
                {
                    Ok(()) => {
                        settle(Settlement::Present(entry));
                        report.pushed += 1;
                    }
                    Err(e) => record_failure(report, key, CollectionKind::Watchlist, SyncOp::Push, e),
                }
            }
            WatchlistPlan::RemoveRemote => {
                match self.store.remove(key, CollectionKind::Watchlist).await {
                    Ok(()) => {
                        settle(Settlement::Evict);
                        report.removed += 1;
                    }
                    Err(e) => {
                        record_failure(report, key, CollectionKind::Watchlist, SyncOp::Remove, e)
                    }
                }
            }
        }
    }

    async fn apply_history(
        &self,
        key: &EntryKey,
        mirror: &LocalMirror,
        observed: Option<u64>,
        plan: HistoryPlan,
        report: &mut SyncReport,
    ) {
        debug!(key = %key, ?plan, "history merge");
        let settle = |outcome| {
            if !mirror.settle_history(&key.profile, key.item, observed, outcome) {
                debug!(key = %key, "local change during pass, left pending");
            }
        };
        match plan {
            HistoryPlan::Nothing => {}
            HistoryPlan::Pull(entry) => {
                settle(Settlement::Present(entry));
                report.pulled += 1;
            }
            HistoryPlan::Keep(entry) => settle(Settlement::Present(entry)),
            HistoryPlan::DropLocal => settle(Settlement::Evict),
            HistoryPlan::Push(entry) => {
                match self
                    .store
                    .upsert(key, CollectionEntry::History(entry.clone()))
                    .await
                {
                    Ok(()) => {
                        settle(Settlement::Present(entry));
                        report.pushed += 1;
                    }
                    Err(e) => record_failure(report, key, CollectionKind::History, SyncOp::Push, e),
                }
            }
            HistoryPlan::RemoveRemote => {
                match self.store.remove(key, CollectionKind::History).await {
                    Ok(()) => {
                        settle(Settlement::Evict);
                        report.removed += 1;
                    }
                    Err(e) => {
                        record_failure(report, key, CollectionKind::History, SyncOp::Remove, e)
                    }
                }
            }
        }
    }
}

fn record_failure(
    report: &mut SyncReport,
    key: &EntryKey,
    kind: CollectionKind,
    op: SyncOp,
    error: marquee_common::StoreError,
) {
    warn!(key = %key, kind = %kind, ?op, "entry sync failed: {}", error);
    report.failures.push(PartialSyncFailure {
        item: key.item,
        kind,
        op,
        reason: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::Origin;
    use crate::store::InMemoryCollectionStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use marquee_common::{StoreError, StoreResult};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn u1() -> Identity {
        Identity::new("U1")
    }

    fn p1() -> ProfileId {
        ProfileId::new("P1")
    }

    fn key(item: u64) -> EntryKey {
        EntryKey::new(u1(), p1(), ItemId(item))
    }

    /// In-memory store that can fail chosen writes and counts them.
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryCollectionStore,
        failing: Mutex<HashSet<ItemId>>,
        read_unavailable: std::sync::atomic::AtomicBool,
        upserts: Mutex<HashMap<ItemId, usize>>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FaultyStore {
        fn fail_item(&self, item: u64) {
            self.failing.lock().insert(ItemId(item));
        }

        fn heal(&self) {
            self.failing.lock().clear();
        }

        fn upserts_for(&self, item: u64) -> usize {
            self.upserts.lock().get(&ItemId(item)).copied().unwrap_or(0)
        }

        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CollectionStore for FaultyStore {
        async fn get_watchlist(&self, identity: &Identity, profile: &ProfileId) -> StoreResult<Vec<WatchlistEntry>> {
            if self.read_unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::unavailable("offline"));
            }
            self.enter().await;
            let result = self.inner.get_watchlist(identity, profile).await;
            self.leave();
            result
        }

        async fn get_history(&self, identity: &Identity, profile: &ProfileId) -> StoreResult<Vec<HistoryEntry>> {
            self.inner.get_history(identity, profile).await
        }

        async fn upsert(&self, key: &EntryKey, entry: CollectionEntry) -> StoreResult<()> {
            if self.failing.lock().contains(&key.item) {
                return Err(StoreError::unavailable("simulated write failure"));
            }
            *self.upserts.lock().entry(key.item).or_default() += 1;
            self.inner.upsert(key, entry).await
        }

        async fn remove(&self, key: &EntryKey, kind: CollectionKind) -> StoreResult<()> {
            if self.failing.lock().contains(&key.item) {
                return Err(StoreError::unavailable("simulated remove failure"));
            }
            self.inner.remove(key, kind).await
        }
    }

    async fn seed_watchlist(store: &dyn CollectionStore, items: &[u64]) {
        for &i in items {
            store
                .upsert(&key(i), CollectionEntry::Watchlist(WatchlistEntry::new(ItemId(i), at(i as i64))))
                .await
                .unwrap();
        }
    }

    /// Mirror that last synced `items` from the remote.
    fn acknowledged_mirror(items: &[u64]) -> LocalMirror {
        let mirror = LocalMirror::new();
        for &i in items {
            let observed = None;
            mirror.settle_watchlist(
                &p1(),
                ItemId(i),
                observed,
                Settlement::Present(WatchlistEntry::new(ItemId(i), at(i as i64))),
            );
        }
        mirror
    }

    #[tokio::test]
    async fn test_watchlist_scenario_tombstone_and_pull() {
        let store = Arc::new(InMemoryCollectionStore::new());
        seed_watchlist(store.as_ref(), &[3, 7, 9]).await;

        let mirror = acknowledged_mirror(&[3, 7]);
        mirror.stage_watchlist_remove(&p1(), ItemId(7), at(100));

        let sync = Synchronizer::new(store.clone());
        let report = sync.sync(&u1(), &p1(), &mirror).await.unwrap();

        assert_eq!(report.converged.watchlist_items(), vec![ItemId(3), ItemId(9)]);
        assert_eq!(report.removed, 1);
        assert_eq!(report.pulled, 1);
        let remote: Vec<ItemId> = store
            .get_watchlist(&u1(), &p1())
            .await
            .unwrap()
            .iter()
            .map(|e| e.item_id)
            .collect();
        assert_eq!(remote, vec![ItemId(3), ItemId(9)]);
        assert!(!mirror.has_pending(&p1()));
    }

    #[tokio::test]
    async fn test_pending_local_entries_pushed_on_first_sync() {
        let store = Arc::new(InMemoryCollectionStore::new());
        let mirror = LocalMirror::new();
        mirror.stage_watchlist_add(&p1(), ItemId(11), at(5));
        mirror.stage_progress(&p1(), HistoryEntry::new(ItemId(12), 300, at(6)));

        let report = Synchronizer::new(store.clone())
            .sync(&u1(), &p1(), &mirror)
            .await
            .unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(store.get_history(&u1(), &p1()).await.unwrap()[0].progress, 300);
        let tracked = mirror.watchlist_entry(&p1(), ItemId(11)).unwrap();
        assert_eq!(tracked.origin, Origin::Remote);
        assert!(!tracked.pending_sync);
    }

    #[tokio::test]
    async fn test_history_later_remote_wins_over_local_progress() {
        let store = Arc::new(InMemoryCollectionStore::new());
        let remote = HistoryEntry::new(ItemId(5), 10, at(200));
        store
            .upsert(&key(5), CollectionEntry::History(remote.clone()))
            .await
            .unwrap();

        let mirror = LocalMirror::new();
        mirror.stage_progress(&p1(), HistoryEntry::new(ItemId(5), 40, at(100)));

        let report = Synchronizer::new(store.clone())
            .sync(&u1(), &p1(), &mirror)
            .await
            .unwrap();
        assert_eq!(report.converged.history_for(ItemId(5)), Some(&remote));
        assert_eq!(store.get_history(&u1(), &p1()).await.unwrap(), vec![remote.clone()]);
        assert_eq!(mirror.history(&p1()), vec![remote]);
    }

    #[tokio::test]
    async fn test_history_conflict_reported() {
        let store = Arc::new(InMemoryCollectionStore::new());
        let remote = HistoryEntry::new(ItemId(5), 40, at(100));
        store
            .upsert(&key(5), CollectionEntry::History(remote.clone()))
            .await
            .unwrap();
        let mirror = LocalMirror::new();
        let local = HistoryEntry::new(ItemId(5), 40, at(100)).with_duration(5400);
        mirror.stage_progress(&p1(), local.clone());

        let report = Synchronizer::new(store.clone())
            .sync(&u1(), &p1(), &mirror)
            .await
            .unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kept, local);
        assert_eq!(store.get_history(&u1(), &p1()).await.unwrap(), vec![local]);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let store = Arc::new(InMemoryCollectionStore::new());
        seed_watchlist(store.as_ref(), &[1, 2]).await;
        let mirror = LocalMirror::new();
        mirror.stage_watchlist_add(&p1(), ItemId(3), at(50));
        mirror.stage_progress(&p1(), HistoryEntry::new(ItemId(4), 20, at(60)));

        let sync = Synchronizer::new(store.clone());
        let first = sync.sync(&u1(), &p1(), &mirror).await.unwrap();
        let second = sync.sync(&u1(), &p1(), &mirror).await.unwrap();
        assert_eq!(first.converged, second.converged);
        assert_eq!(second.pushed, 0);
        assert_eq!(second.pulled, 0);
        assert_eq!(second.removed, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_retried_without_repushing() {
        let store = Arc::new(FaultyStore::default());
        store.fail_item(2);
        let mirror = LocalMirror::new();
        for i in 1..=3 {
            mirror.stage_watchlist_add(&p1(), ItemId(i), at(i as i64));
        }

        let sync = Synchronizer::new(store.clone());
        let report = sync.sync(&u1(), &p1(), &mirror).await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, ItemId(2));
        assert_eq!(report.failures[0].op, SyncOp::Push);
        assert!(mirror.watchlist_entry(&p1(), ItemId(2)).unwrap().pending_sync);
        assert!(!mirror.watchlist_entry(&p1(), ItemId(1)).unwrap().pending_sync);
        // The failed entry is still visible locally.
        assert_eq!(report.converged.watchlist.len(), 3);

        store.heal();
        let retry = sync.sync(&u1(), &p1(), &mirror).await.unwrap();
        assert!(retry.is_complete());
        assert_eq!(retry.pushed, 1);
        assert_eq!(store.upserts_for(1), 1);
        assert_eq!(store.upserts_for(2), 1);
        assert_eq!(store.upserts_for(3), 1);
        assert!(!mirror.has_pending(&p1()));
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_tombstone() {
        let store = Arc::new(FaultyStore::default());
        seed_watchlist(&store.inner, &[7]).await;
        let mirror = acknowledged_mirror(&[7]);
        mirror.stage_watchlist_remove(&p1(), ItemId(7), at(100));
        store.fail_item(7);

        let sync = Synchronizer::new(store.clone());
        let report = sync.sync(&u1(), &p1(), &mirror).await.unwrap();
        assert_eq!(report.failures[0].op, SyncOp::Remove);
        assert!(mirror.watchlist_entry(&p1(), ItemId(7)).unwrap().is_tombstone());
        assert!(report.converged.watchlist.is_empty());

        store.heal();
        sync.sync(&u1(), &p1(), &mirror).await.unwrap();
        assert!(store.inner.get_watchlist(&u1(), &p1()).await.unwrap().is_empty());
        assert!(mirror.watchlist_entry(&p1(), ItemId(7)).is_none());
    }

    #[tokio::test]
    async fn test_unreadable_store_leaves_mirror_untouched() {
        let store = Arc::new(FaultyStore::default());
        store.read_unavailable.store(true, Ordering::SeqCst);
        let mirror = LocalMirror::new();
        mirror.stage_watchlist_add(&p1(), ItemId(1), at(1));
        let before = mirror.snapshot(&p1());

        let result = Synchronizer::new(store).sync(&u1(), &p1(), &mirror).await;
        assert!(matches!(result, Err(SyncError::StoreUnavailable(_))));
        assert_eq!(mirror.snapshot(&p1()), before);
    }

    #[tokio::test]
    async fn test_entry_removed_on_other_device_is_dropped() {
        let store = Arc::new(InMemoryCollectionStore::new());
        let mirror = acknowledged_mirror(&[4]);
        let report = Synchronizer::new(store)
            .sync(&u1(), &p1(), &mirror)
            .await
            .unwrap();
        assert!(report.converged.watchlist.is_empty());
        assert!(mirror.watchlist_entry(&p1(), ItemId(4)).is_none());
    }

    #[tokio::test]
    async fn test_profiles_do_not_leak() {
        let store = Arc::new(InMemoryCollectionStore::new());
        seed_watchlist(store.as_ref(), &[1]).await;
        let mirror = LocalMirror::new();
        mirror.stage_watchlist_add(&ProfileId::new("P2"), ItemId(2), at(2));

        let sync = Synchronizer::new(store.clone());
        let report = sync
            .sync(&u1(), &ProfileId::new("P2"), &mirror)
            .await
            .unwrap();
        assert_eq!(report.converged.watchlist_items(), vec![ItemId(2)]);
        assert!(mirror.watchlist(&p1()).is_empty());
        let p1_remote = store.get_watchlist(&u1(), &p1()).await.unwrap();
        assert_eq!(p1_remote.len(), 1);
        assert_eq!(p1_remote[0].item_id, ItemId(1));
    }

    #[tokio::test]
    async fn test_same_key_passes_are_serialized() {
        let store = Arc::new(FaultyStore {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let sync = Arc::new(Synchronizer::new(store.clone()));
        let mirror = Arc::new(LocalMirror::new());
        mirror.stage_watchlist_add(&p1(), ItemId(1), at(1));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let sync = sync.clone();
            let mirror = mirror.clone();
            tasks.push(tokio::spawn(async move {
                sync.sync(&u1(), &p1(), &mirror).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(store.upserts_for(1), 1);
    }

    #[tokio::test]
    async fn test_different_profiles_run_in_parallel() {
        let store = Arc::new(FaultyStore {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let sync = Arc::new(Synchronizer::new(store.clone()));
        let mirror = Arc::new(LocalMirror::new());

        let a = {
            let (sync, mirror) = (sync.clone(), mirror.clone());
            tokio::spawn(async move { sync.sync(&u1(), &ProfileId::new("A"), &mirror).await })
        };
        let b = {
            let (sync, mirror) = (sync.clone(), mirror.clone());
            tokio::spawn(async move { sync.sync(&u1(), &ProfileId::new("B"), &mirror).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 2);
    }
}

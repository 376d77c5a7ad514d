//! Post-authentication collection access for one `(identity, profile)`.
//!
//! Writes land in the mirror immediately and are then pushed through a sync
//! pass, so remote writes obey the same merge rules and the same per-key
//! serialization as the initial reconciliation.

use chrono::Utc;
use marquee_common::{HistoryEntry, Identity, ItemId, ProfileId, WatchlistEntry};
use std::sync::Arc;

use crate::error::Result;
use crate::mirror::LocalMirror;
use crate::synchronizer::{SyncReport, Synchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store acknowledged the change.
    Committed,
    /// Applied locally only; retried on the next sync trigger.
    Pending,
}

pub struct Collections {
    identity: Identity,
    profile: ProfileId,
    mirror: Arc<LocalMirror>,
    synchronizer: Arc<Synchronizer>,
}

impl Collections {
    pub fn new(
        identity: Identity,
        profile: ProfileId,
        mirror: Arc<LocalMirror>,
        synchronizer: Arc<Synchronizer>,
    ) -> Self {
        Self {
            identity,
            profile,
            mirror,
            synchronizer,
        }
    }

    pub fn profile(&self) -> &ProfileId {
        &self.profile
    }

    pub fn watchlist(&self) -> Vec<WatchlistEntry> {
        self.mirror.watchlist(&self.profile)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.mirror.history(&self.profile)
    }

    pub fn in_watchlist(&self, item: ItemId) -> bool {
        self.mirror
            .watchlist_entry(&self.profile, item)
            .map(|t| !t.is_tombstone())
            .unwrap_or(false)
    }

    /// Full reconciliation, e.g. after reconnecting.
    pub async fn refresh(&self) -> Result<SyncReport> {
        self.synchronizer
            .sync(&self.identity, &self.profile, &self.mirror)
            .await
    }

    pub async fn add_to_watchlist(&self, item: ItemId) -> WriteOutcome {
        self.mirror
            .stage_watchlist_add(&self.profile, item, Utc::now());
        self.flush(item, |m, p, i| m.watchlist_entry(p, i).map(|t| t.pending_sync))
            .await
    }

    pub async fn remove_from_watchlist(&self, item: ItemId) -> WriteOutcome {
        self.mirror
            .stage_watchlist_remove(&self.profile, item, Utc::now());
        self.flush(item, |m, p, i| m.watchlist_entry(p, i).map(|t| t.pending_sync))
            .await
    }

    pub async fn record_progress(
        &self,
        item: ItemId,
        progress: u64,
        duration: Option<u64>,
    ) -> WriteOutcome {
        let mut entry = HistoryEntry::new(item, progress, Utc::now());
        entry.duration = duration;
        self.mirror.stage_progress(&self.profile, entry);
        self.flush(item, |m, p, i| m.history_entry(p, i).map(|t| t.pending_sync))
            .await
    }

    pub async fn remove_from_history(&self, item: ItemId) -> WriteOutcome {
        self.mirror
            .stage_history_remove(&self.profile, item, Utc::now());
        self.flush(item, |m, p, i| m.history_entry(p, i).map(|t| t.pending_sync))
            .await
    }

    async fn flush<F>(&self, item: ItemId, pending: F) -> WriteOutcome
    where
        F: Fn(&LocalMirror, &ProfileId, ItemId) -> Option<bool>,
    {
        if let Err(e) = self.refresh().await {
            tracing::warn!(item = %item, "write kept local, store unreachable: {}", e);
            return WriteOutcome::Pending;
        }
        // A settled entry is either clean or gone entirely.
        match pending(&self.mirror, &self.profile, item) {
            Some(true) => WriteOutcome::Pending,
            _ => WriteOutcome::Committed,
        }
    }
}

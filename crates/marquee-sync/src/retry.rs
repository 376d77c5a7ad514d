//! Periodic re-sync while the mirror holds unacknowledged entries.

use marquee_common::{Identity, ProfileId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::mirror::LocalMirror;
use crate::synchronizer::Synchronizer;

/// Background retry task. Stops when dropped or cancelled.
pub struct RetryHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RetryHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to finish its current pass.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RetryHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn spawn_periodic_retry(
    synchronizer: Arc<Synchronizer>,
    identity: Identity,
    profile: ProfileId,
    mirror: Arc<LocalMirror>,
    interval: Duration,
) -> RetryHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !mirror.has_pending(&profile) {
                        continue;
                    }
                    match synchronizer.sync(&identity, &profile, &mirror).await {
                        Ok(report) if report.is_complete() => {
                            tracing::info!(profile = %profile, "retry flushed pending entries");
                        }
                        Ok(report) => {
                            tracing::debug!(
                                profile = %profile,
                                failed = report.failures.len(),
                                "retry pass still has pending entries"
                            );
                        }
                        Err(e) => tracing::warn!(profile = %profile, "retry pass failed: {}", e),
                    }
                }
            }
        }
        tracing::debug!(profile = %profile, "retry task stopped");
    });
    RetryHandle {
        cancel,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CollectionStore, InMemoryCollectionStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use marquee_common::{
        CollectionEntry, CollectionKind, EntryKey, HistoryEntry, ItemId, StoreError, StoreResult,
        WatchlistEntry,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects the first `failures` writes.
    struct FlakyStore {
        inner: InMemoryCollectionStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl CollectionStore for FlakyStore {
        async fn get_watchlist(&self, i: &Identity, p: &ProfileId) -> StoreResult<Vec<WatchlistEntry>> {
            self.inner.get_watchlist(i, p).await
        }
        async fn get_history(&self, i: &Identity, p: &ProfileId) -> StoreResult<Vec<HistoryEntry>> {
            self.inner.get_history(i, p).await
        }
        async fn upsert(&self, key: &EntryKey, entry: CollectionEntry) -> StoreResult<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::unavailable("flaky"));
            }
            self.inner.upsert(key, entry).await
        }
        async fn remove(&self, key: &EntryKey, kind: CollectionKind) -> StoreResult<()> {
            self.inner.remove(key, kind).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_flushes_after_transient_failures() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryCollectionStore::new(),
            failures: AtomicUsize::new(2),
        });
        let sync = Arc::new(Synchronizer::new(store.clone()));
        let mirror = Arc::new(LocalMirror::new());
        let (identity, profile) = (Identity::new("u1"), ProfileId::new("p1"));
        mirror.stage_watchlist_add(&profile, ItemId(42), Utc::now());

        let handle = spawn_periodic_retry(
            sync,
            identity.clone(),
            profile.clone(),
            mirror.clone(),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(mirror.has_pending(&profile));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!mirror.has_pending(&profile));
        assert_eq!(store.inner.get_watchlist(&identity, &profile).await.unwrap().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_task() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryCollectionStore::new(),
            failures: AtomicUsize::new(0),
        });
        let sync = Arc::new(Synchronizer::new(store.clone()));
        let mirror = Arc::new(LocalMirror::new());
        let profile = ProfileId::new("p1");

        let handle = spawn_periodic_retry(
            sync,
            Identity::new("u1"),
            profile.clone(),
            mirror.clone(),
            Duration::from_secs(10),
        );
        drop(handle);

        mirror.stage_watchlist_add(&profile, ItemId(1), Utc::now());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(mirror.has_pending(&profile));
    }
}

//! Role system of record.

use async_trait::async_trait;
use dashmap::DashMap;
use marquee_common::{Identity, Role, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Authoritative role lookup. Implementations must return the current value
/// on every call.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// `Ok(None)` when no such identity exists.
    async fn get_role(&self, identity: &Identity) -> StoreResult<Option<Role>>;
}

/// Administrative role mutation. Sessions never go through this.
#[async_trait]
pub trait RoleAdmin: Send + Sync {
    async fn set_role(&self, identity: &Identity, role: Role) -> StoreResult<()>;
}

#[derive(Default)]
pub struct InMemoryRoleStore {
    roles: DashMap<Identity, Role>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, identity: Identity, role: Role) -> Self {
        self.roles.insert(identity, role);
        self
    }

    pub fn remove(&self, identity: &Identity) {
        self.roles.remove(identity);
    }

}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn get_role(&self, identity: &Identity) -> StoreResult<Option<Role>> {
        Ok(self.roles.get(identity).map(|r| *r.value()))
    }
}

#[async_trait]
impl RoleAdmin for InMemoryRoleStore {
    async fn set_role(&self, identity: &Identity, role: Role) -> StoreResult<()> {
        self.roles.insert(identity.clone(), role);
        tracing::info!(identity = %identity, role = %role, "role updated");
        Ok(())
    }
}

/// Short-lived role cache in front of a [`RoleStore`].
///
/// A revocation made elsewhere becomes visible within `ttl`. A revocation
/// made through this wrapper's [`RoleAdmin::set_role`] is visible
/// immediately, including to reads already in flight when it ran. A zero
/// `ttl` disables caching entirely.
pub struct CachedRoleStore<S> {
    inner: Arc<S>,
    ttl: Duration,
    entries: Mutex<RoleCache>,
}

#[derive(Default)]
struct RoleCache {
    roles: HashMap<Identity, (Option<Role>, Instant)>,
    /// Bumped on every invalidation; a read started under an older
    /// generation does not populate the cache.
    generation: u64,
}

impl<S> CachedRoleStore<S> {
    pub fn new(inner: Arc<S>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(RoleCache::default()),
        }
    }

    pub fn invalidate(&self, identity: &Identity) {
        let mut cache = self.entries.lock();
        cache.generation += 1;
        cache.roles.remove(identity);
    }

    /// Cached role, or the generation a fresh read must start under.
    fn cached(&self, identity: &Identity) -> Result<Option<Role>, u64> {
        let mut cache = self.entries.lock();
        match cache.roles.get(identity) {
            Some((role, at)) if at.elapsed() < self.ttl => Ok(*role),
            Some(_) => {
                cache.roles.remove(identity);
                Err(cache.generation)
            }
            None => Err(cache.generation),
        }
    }
}

#[async_trait]
impl<S: RoleStore> RoleStore for CachedRoleStore<S> {
    async fn get_role(&self, identity: &Identity) -> StoreResult<Option<Role>> {
        if self.ttl.is_zero() {
            return self.inner.get_role(identity).await;
        }
        let started = match self.cached(identity) {
            Ok(role) => return Ok(role),
            Err(generation) => generation,
        };
        // Errors are not cached; the next call retries the store.
        let role = self.inner.get_role(identity).await?;
        let mut cache = self.entries.lock();
        if cache.generation == started {
            cache.roles.insert(identity.clone(), (role, Instant::now()));
        }
        Ok(role)
    }
}

#[async_trait]
impl<S: RoleAdmin> RoleAdmin for CachedRoleStore<S> {
    async fn set_role(&self, identity: &Identity, role: Role) -> StoreResult<()> {
        let result = self.inner.set_role(identity, role).await;
        self.invalidate(identity);
        result
    }
}

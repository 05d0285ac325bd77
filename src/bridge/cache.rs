//! Per-thread bridge pool with LRU eviction
//!
//! Bridges are created on first acquisition for a [`ThreadKey`] and kept so the
//! interpreter state survives between executions in that thread. A bridge is
//! leased to one holder at a time; only idle bridges are ever evicted.

use lru::LruCache;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::engine::EngineKind;
use super::error::BridgeResult;
use super::host::HostFunction;
use super::limits::ResourceLimits;
use super::InterpreterBridge;
use crate::domain::{PlatformConstraints, ThreadKey};

/// Installs the host functions a new bridge starts with
pub type HostInstaller = Arc<dyn Fn(&ThreadKey) -> Vec<HostFunction> + Send + Sync>;

/// How the cache builds bridges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    pub engine: EngineKind,
    pub limits: ResourceLimits,
}

struct Entry {
    bridge: InterpreterBridge,
    lease: Option<u64>,
}

struct CacheState {
    entries: LruCache<ThreadKey, Entry>,
    next_lease: u64,
}

struct CacheShared {
    limit: usize,
    config: BridgeConfig,
    constraints: PlatformConstraints,
    installer: Option<HostInstaller>,
    state: Mutex<CacheState>,
    released: Notify,
}

/// Sole owner of interpreter bridges
#[derive(Clone)]
pub struct BridgeCache {
    shared: Arc<CacheShared>,
}

impl BridgeCache {
    pub fn new(config: BridgeConfig, constraints: PlatformConstraints) -> Self {
        Self::build(config, constraints, None)
    }

    /// Like [`BridgeCache::new`], registering `installer`'s functions on every new bridge
    pub fn with_installer(
        config: BridgeConfig,
        constraints: PlatformConstraints,
        installer: HostInstaller,
    ) -> Self {
        Self::build(config, constraints, Some(installer))
    }

    fn build(
        config: BridgeConfig,
        constraints: PlatformConstraints,
        installer: Option<HostInstaller>,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                limit: constraints.execution_permits(),
                config,
                constraints,
                installer,
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    next_lease: 0,
                }),
                released: Notify::new(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ThreadKey) -> bool {
        self.state().entries.contains(key)
    }

    /// Lease the bridge of `key`, creating it if needed.
    ///
    /// Waits while the bridge is leased elsewhere, or while the cache is full
    /// and nothing can be evicted.
    pub async fn acquire(&self, key: &ThreadKey) -> BridgeResult<BridgeLease> {
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(key)? {
                return Ok(lease);
            }
            debug!(thread_id = %key, "Waiting for a bridge to be released");
            notified.await;
        }
    }

    fn try_acquire(&self, key: &ThreadKey) -> BridgeResult<Option<BridgeLease>> {
        let mut state = self.state();
        let id = state.next_lease;
        state.next_lease += 1;

        if let Some(entry) = state.entries.get_mut(key) {
            if entry.lease.is_some() {
                return Ok(None);
            }
            entry.lease = Some(id);
            return Ok(Some(self.lease(key, entry.bridge.clone(), id)));
        }

        if state.entries.len() >= self.shared.limit {
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.lease.is_none() && !entry.bridge.is_executing())
                .map(|(victim, _)| victim.clone());
            let Some(victim) = victim else {
                return Ok(None);
            };
            if let Some(evicted) = state.entries.pop(&victim) {
                evicted.bridge.dispose();
                info!(thread_id = %victim, "Evicted least recently used bridge");
            }
        }

        let config = self.shared.config;
        let bridge = InterpreterBridge::new(config.engine, config.limits, self.shared.constraints)?;
        if let Some(installer) = &self.shared.installer {
            for function in installer(key) {
                bridge.register(function);
            }
        }
        state.entries.put(
            key.clone(),
            Entry {
                bridge: bridge.clone(),
                lease: Some(id),
            },
        );
        debug!(thread_id = %key, engine = %config.engine, "Created bridge");
        Ok(Some(self.lease(key, bridge, id)))
    }

    fn lease(&self, key: &ThreadKey, bridge: InterpreterBridge, id: u64) -> BridgeLease {
        BridgeLease {
            cache: self.clone(),
            key: key.clone(),
            id,
            bridge,
        }
    }

    /// Release whatever lease is held on `key`
    pub fn release(&self, key: &ThreadKey) {
        if let Some(entry) = self.state().entries.peek_mut(key) {
            entry.lease = None;
        }
        self.shared.released.notify_waiters();
    }

    fn release_lease(&self, key: &ThreadKey, id: u64) {
        if let Some(entry) = self.state().entries.peek_mut(key) {
            if entry.lease == Some(id) {
                entry.lease = None;
            }
        }
        self.shared.released.notify_waiters();
    }

    /// Dispose and drop the bridge of `key` if it is idle
    pub fn evict(&self, key: &ThreadKey) -> bool {
        let mut state = self.state();
        let idle = state
            .entries
            .peek(key)
            .map(|entry| entry.lease.is_none() && !entry.bridge.is_executing())
            .unwrap_or(false);
        if !idle {
            return false;
        }
        if let Some(entry) = state.entries.pop(key) {
            entry.bridge.dispose();
        }
        drop(state);
        self.shared.released.notify_waiters();
        true
    }

    /// Dispose every bridge, leased or not
    pub fn clear(&self) {
        let mut state = self.state();
        while let Some((key, entry)) = state.entries.pop_lru() {
            debug!(thread_id = %key, "Disposing bridge");
            entry.bridge.dispose();
        }
        drop(state);
        self.shared.released.notify_waiters();
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of one cached bridge, returned to the cache on drop
pub struct BridgeLease {
    cache: BridgeCache,
    key: ThreadKey,
    id: u64,
    bridge: InterpreterBridge,
}

impl BridgeLease {
    pub fn key(&self) -> &ThreadKey {
        &self.key
    }

    pub fn bridge(&self) -> &InterpreterBridge {
        &self.bridge
    }
}

impl Deref for BridgeLease {
    type Target = InterpreterBridge;

    fn deref(&self) -> &Self::Target {
        &self.bridge
    }
}

impl Drop for BridgeLease {
    fn drop(&mut self) {
        self.cache.release_lease(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::schema::HostFunctionSchema;
    use serde_json::json;
    use std::time::Duration;

    fn key(thread: &str) -> ThreadKey {
        ThreadKey::new("srv", "room", thread)
    }

    fn cache(limit: usize) -> BridgeCache {
        BridgeCache::new(
            BridgeConfig::default(),
            PlatformConstraints {
                max_concurrent_bridges: limit,
                ..PlatformConstraints::default()
            },
        )
    }

    #[tokio::test]
    async fn test_same_key_reuses_bridge_state() {
        let cache = cache(2);
        {
            let lease = cache.acquire(&key("a")).await.unwrap();
            lease.execute("counter = 1").collect().await;
        }
        let lease = cache.acquire(&key("a")).await.unwrap();
        let outcome = lease.execute("return counter + 1").collect().await;
        assert_eq!(outcome.value, Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let cache = cache(2);
        let first = cache.acquire(&key("a")).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), cache.acquire(&key("a"))).await;
        assert!(waiting.is_err());

        let pending = tokio::spawn({
            let cache = cache.clone();
            async move { cache.acquire(&key("a")).await.map(|lease| lease.key().clone()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        let acquired = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(acquired, key("a"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_least_recently_used_idle_bridge_is_evicted() {
        let cache = cache(2);
        let a = cache.acquire(&key("a")).await.unwrap();
        let a_bridge = a.bridge().clone();
        drop(a);
        drop(cache.acquire(&key("b")).await.unwrap());

        drop(cache.acquire(&key("c")).await.unwrap());

        assert!(!cache.contains(&key("a")));
        assert!(cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert!(a_bridge.is_disposed());
    }

    #[tokio::test]
    async fn test_leased_bridge_is_never_evicted() {
        let cache = cache(1);
        let a = cache.acquire(&key("a")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), cache.acquire(&key("b"))).await;
        assert!(blocked.is_err());
        assert!(cache.contains(&key("a")));

        let pending = tokio::spawn({
            let cache = cache.clone();
            async move { cache.acquire(&key("b")).await.is_ok() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(a);

        assert!(tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap());
        assert!(!cache.contains(&key("a")));
    }

    #[tokio::test]
    async fn test_release_by_key() {
        let cache = cache(2);
        let lease = cache.acquire(&key("a")).await.unwrap();
        cache.release(&key("a"));

        let again = tokio::time::timeout(Duration::from_millis(100), cache.acquire(&key("a"))).await;
        assert!(again.is_ok());
        drop(lease);
    }

    #[tokio::test]
    async fn test_installer_registers_functions() {
        let installer: HostInstaller = Arc::new(|key: &ThreadKey| {
            let thread = key.thread_id.clone();
            vec![HostFunction::from_fn(
                HostFunctionSchema::new("thread_id", "Current thread"),
                move |_| {
                    let thread = thread.clone();
                    async move { Ok(json!(thread)) }
                },
            )]
        });
        let cache = BridgeCache::with_installer(
            BridgeConfig::default(),
            PlatformConstraints::default(),
            installer,
        );

        let lease = cache.acquire(&key("t-9")).await.unwrap();
        let outcome = lease.execute("return thread_id()").collect().await;
        assert_eq!(outcome.value, Some(json!("t-9")));
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let cache = cache(3);
        let held = cache.acquire(&key("a")).await.unwrap();
        drop(cache.acquire(&key("b")).await.unwrap());

        assert!(!cache.evict(&key("a")));
        assert!(cache.evict(&key("b")));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(held.is_disposed());
    }
}

//! In-memory store for tests/dev.
//!
//! Mirrors the Redis semantics the services depend on: TTL expiry (against
//! an injected [`Clock`]), head/tail list operations and a blocking tail pop
//! with a real timeout. It also supports fault injection so fail-open and
//! fail-closed paths can be exercised without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use storefront_core::{Clock, SystemClock};

use super::{KvStore, StoreConnector, glob_match};
use crate::error::{StoreError, StoreResult};
use crate::registry::Component;

#[derive(Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, StoredValue>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
}

impl MemoryState {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.values
            .retain(|_, v| v.expires_at.map_or(true, |at| at > now));
    }
}

/// Process-local [`KvStore`].
#[derive(Debug)]
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
    pushed: Notify,
    unavailable: AtomicBool,
    pings: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
            pushed: Notify::new(),
            unavailable: AtomicBool::new(false),
            pings: AtomicU64::new(0),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        // Wake blocked pops so they observe the outage.
        self.pushed.notify_waiters();
    }

    /// Number of successful pings served.
    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.purge_expired(self.clock.now());
        guard
    }

    fn pop_tail(&self, list: &str) -> Option<Vec<u8>> {
        let mut state = self.state();
        let entries = state.lists.get_mut(list)?;
        let value = entries.pop_back();
        if entries.is_empty() {
            state.lists.remove(list);
        }
        value
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_available()?;
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.state().values.get(key).map(|v| v.bytes.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.check_available()?;
        self.state().values.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        // A deadline past the representable range never expires.
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(chrono::Duration::milliseconds(ttl_ms));
        self.state().values.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let state = self.state();
        Ok(state.values.contains_key(key) || state.lists.contains_key(key))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.state();
        let mut removed = 0;
        for key in keys {
            if state.values.remove(key).is_some() || state.lists.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let state = self.state();
        let mut found: Vec<String> = state
            .values
            .keys()
            .chain(state.lists.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }

    async fn lpush(&self, list: &str, value: Vec<u8>) -> StoreResult<()> {
        self.check_available()?;
        self.state()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn rpush(&self, list: &str, value: Vec<u8>) -> StoreResult<()> {
        self.check_available()?;
        self.state()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop(&self, list: &str, timeout: Duration) -> StoreResult<Option<Vec<u8>>> {
        self.check_available()?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_tail(list) {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
            self.check_available()?;
        }
    }

    async fn llen(&self, list: &str) -> StoreResult<u64> {
        self.check_available()?;
        Ok(self.state().lists.get(list).map_or(0, |l| l.len() as u64))
    }

    async fn lrem(&self, list: &str, value: &[u8]) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.state();
        let Some(entries) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| e.as_slice() != value);
        let removed = (before - entries.len()) as u64;
        if entries.is_empty() {
            state.lists.remove(list);
        }
        Ok(removed)
    }

    async fn lrange(&self, list: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>> {
        self.check_available()?;
        let state = self.state();
        let Some(entries) = state.lists.get(list) else {
            return Ok(Vec::new());
        };

        let len = entries.len() as isize;
        let start = if start < 0 { (start + len).max(0) } else { start };
        let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(entries
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }
}

/// Hands out one [`InMemoryStore`] per component.
#[derive(Debug)]
pub struct InMemoryConnector {
    stores: HashMap<Component, Arc<InMemoryStore>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let stores = Component::ALL
            .into_iter()
            .map(|c| (c, Arc::new(InMemoryStore::with_clock(clock.clone()))))
            .collect();
        Self { stores }
    }

    /// The store backing `component` (for inspection and fault injection).
    pub fn store(&self, component: Component) -> Arc<InMemoryStore> {
        self.stores[&component].clone()
    }

    /// Toggle availability of every store at once.
    pub fn set_unavailable(&self, unavailable: bool) {
        for store in self.stores.values() {
            store.set_unavailable(unavailable);
        }
    }
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StoreConnector for InMemoryConnector {
    async fn connect(&self, component: Component) -> StoreResult<Arc<dyn KvStore>> {
        let store: Arc<dyn KvStore> = self.store(component);
        Ok(store)
    }
}

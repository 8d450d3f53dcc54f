use std::{
    borrow::Borrow,
    collections::HashMap,
    rc::Rc,
    time::{Duration, Instant},
};

use derive_ex::derive_ex;
use parse_display::Display;
use tracing::trace;


/// Identifier of a loadable resource, used for both caching and deduplication.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{0}")]
pub struct RequestKey(Rc<str>);

impl RequestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}
impl From<String> for RequestKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}
impl From<&RequestKey> for RequestKey {
    fn from(key: &RequestKey) -> Self {
        key.clone()
    }
}
impl Borrow<str> for RequestKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Source of the current time for cache expiry.
pub trait Clock: 'static {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Expiry and eviction settings of a [`MemoryCache`].
///
/// The default keeps every entry forever.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Entries older than this are treated as absent.
    pub ttl: Option<Duration>,
    /// Maximum number of entries. The oldest entry is evicted to make room.
    pub capacity: Option<usize>,
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(self, ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..self
        }
    }
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..self
        }
    }
}

/// Successful result stored for a key.
#[derive(Debug)]
#[derive_ex(Clone, bound())]
pub struct CacheEntry<T> {
    pub key: RequestKey,
    pub value: Rc<T>,
    pub created_at: Instant,
}

/// Storage of resolved values, keyed by [`RequestKey`].
pub trait CacheStore<T>: 'static {
    /// Returns the entry for `key` if present and still valid.
    fn get(&mut self, key: &RequestKey) -> Option<CacheEntry<T>>;
    /// Stores `value`, replacing any previous entry.
    fn set(&mut self, key: RequestKey, value: Rc<T>);
    /// Returns `true` if an entry was removed.
    fn invalidate(&mut self, key: &RequestKey) -> bool;
    fn clear(&mut self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process [`CacheStore`].
pub struct MemoryCache<T> {
    entries: HashMap<RequestKey, CacheEntry<T>>,
    policy: CachePolicy,
    clock: Rc<dyn Clock>,
}

impl<T: 'static> MemoryCache<T> {
    pub fn new(policy: CachePolicy) -> Self {
        Self::with_clock(policy, Rc::new(SystemClock))
    }
    pub fn with_clock(policy: CachePolicy, clock: Rc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
            clock,
        }
    }
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn is_expired(&self, entry: &CacheEntry<T>, now: Instant) -> bool {
        match self.policy.ttl {
            Some(ttl) => now.saturating_duration_since(entry.created_at) >= ttl,
            None => false,
        }
    }
    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .values()
            .min_by_key(|e| e.created_at)
            .map(|e| e.key.clone());
        if let Some(key) = oldest {
            trace!(key = %key, "evicting cache entry");
            self.entries.remove(&key);
        }
    }
}
impl<T: 'static> Default for MemoryCache<T> {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl<T: 'static> CacheStore<T> for MemoryCache<T> {
    fn get(&mut self, key: &RequestKey) -> Option<CacheEntry<T>> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?;
        if self.is_expired(entry, now) {
            trace!(key = %key, "cache entry expired");
            self.entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    fn set(&mut self, key: RequestKey, value: Rc<T>) {
        if let Some(capacity) = self.policy.capacity {
            if capacity == 0 {
                return;
            }
            while !self.entries.contains_key(&key) && self.entries.len() >= capacity {
                self.evict_oldest();
            }
        }
        let created_at = self.clock.now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at,
            },
        );
    }

    fn invalidate(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }
    fn clear(&mut self) {
        self.entries.clear();
    }
    fn len(&self) -> usize {
        self.entries.len()
    }
}

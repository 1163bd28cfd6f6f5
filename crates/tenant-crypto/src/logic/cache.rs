use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use super::{DecryptedDataKey, EncryptionPurpose};

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_CURRENT_POINTER_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of key versions held at once.
    pub capacity: usize,
    pub entry_ttl: Option<Duration>,
    /// How long a cached current-version pointer is trusted. Rotations made
    /// by another process become visible to encrypt once it lapses.
    pub current_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CACHE_CAPACITY,
            entry_ttl: None,
            current_ttl: DEFAULT_CURRENT_POINTER_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CacheStats {
    pub size: usize,
    /// hits / (hits + misses), `0.0` before the first lookup
    pub hit_rate: f64,
    /// Approximate bytes held by cached entries.
    pub memory_usage: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub capacity: usize,
}

type VersionKey = (String, EncryptionPurpose, i64);
type PairKey = (String, EncryptionPurpose);

struct CurrentPointer {
    version: i64,
    installed_at: Instant,
}

struct CachedKey {
    key: Arc<DecryptedDataKey>,
    inserted_at: Instant,
    last_access: AtomicU64,
}

/// Decrypted data keys by `(tenant, purpose, version)`, plus a pointer to the
/// current version of each `(tenant, purpose)`.
///
/// Every pair also carries an epoch. [`OperationCache::invalidate_current`]
/// bumps it, and [`OperationCache::put_current`] only installs a pointer if
/// the epoch still matches the one read before the repository lookup, so a
/// load that raced a rotation cannot reinstate the retired version.
/// Lock order is always `epochs` then `current`. Pointers also lapse after
/// [`CacheConfig::current_ttl`], which bounds how long a rotation committed
/// by another process on the same database goes unseen.
pub struct OperationCache {
    config: CacheConfig,
    entries: DashMap<VersionKey, CachedKey>,
    current: DashMap<PairKey, CurrentPointer>,
    epochs: DashMap<PairKey, u64>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl OperationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            current: DashMap::new(),
            epochs: DashMap::new(),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn is_expired(&self, entry: &CachedKey) -> bool {
        self.config
            .entry_ttl
            .is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }

    fn miss(&self) -> Option<Arc<DecryptedDataKey>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn get(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        version: i64,
    ) -> Option<Arc<DecryptedDataKey>> {
        if !self.config.enabled {
            return self.miss();
        }

        let key = (tenant_id.to_string(), purpose, version);
        let expired = match self.entries.get(&key) {
            None => {
                debug!(tenant_id, %purpose, version, "key cache miss");
                return self.miss();
            }
            Some(entry) if !self.is_expired(&entry) => {
                entry
                    .last_access
                    .store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(tenant_id, %purpose, version, "key cache hit");
                return Some(entry.key.clone());
            }
            Some(_) => true,
        };

        if expired {
            self.entries
                .remove_if(&key, |_, entry| self.is_expired(entry));
            debug!(tenant_id, %purpose, version, "key cache entry expired");
        }
        self.miss()
    }

    pub fn insert(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        version: i64,
        key: Arc<DecryptedDataKey>,
    ) {
        if !self.config.enabled || self.config.capacity == 0 {
            return;
        }

        self.entries.insert(
            (tenant_id.to_string(), purpose, version),
            CachedKey {
                key,
                inserted_at: Instant::now(),
                last_access: AtomicU64::new(self.tick.fetch_add(1, Ordering::Relaxed)),
            },
        );

        while self.entries.len() > self.config.capacity {
            if !self.evict_least_recently_used() {
                break;
            }
        }
    }

    // Linear scan over all entries; fine while capacity stays in the low
    // thousands.
    fn evict_least_recently_used(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        match oldest {
            Some(key) => {
                if self.entries.remove(&key).is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    pub fn current_version(&self, tenant_id: &str, purpose: EncryptionPurpose) -> Option<i64> {
        if !self.config.enabled {
            return None;
        }
        let pair = (tenant_id.to_string(), purpose);
        let lapsed = match self.current.get(&pair) {
            None => return None,
            Some(pointer) if pointer.installed_at.elapsed() < self.config.current_ttl => {
                return Some(pointer.version);
            }
            Some(_) => true,
        };

        if lapsed {
            self.current.remove_if(&pair, |_, pointer| {
                pointer.installed_at.elapsed() >= self.config.current_ttl
            });
            debug!(tenant_id, %purpose, "current key pointer lapsed");
        }
        None
    }

    /// Epoch to hand back to [`OperationCache::put_current`] after loading
    /// the current version from the repository.
    pub fn epoch(&self, tenant_id: &str, purpose: EncryptionPurpose) -> u64 {
        self.epochs
            .get(&(tenant_id.to_string(), purpose))
            .map(|e| *e)
            .unwrap_or(0)
    }

    /// Installs the current-version pointer unless the pair was invalidated
    /// since `observed_epoch` was read. Returns whether it was installed.
    pub fn put_current(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        version: i64,
        observed_epoch: u64,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        let pair = (tenant_id.to_string(), purpose);
        let epoch = self.epochs.entry(pair.clone()).or_insert(0);
        if *epoch != observed_epoch {
            debug!(tenant_id, %purpose, version, "discarding stale current key pointer");
            return false;
        }
        self.current.insert(
            pair,
            CurrentPointer {
                version,
                installed_at: Instant::now(),
            },
        );
        drop(epoch);
        true
    }

    /// Drops the current-version pointer for a pair. Cached versions stay
    /// usable for decryption.
    pub fn invalidate_current(&self, tenant_id: &str, purpose: EncryptionPurpose) {
        let pair = (tenant_id.to_string(), purpose);
        let mut epoch = self.epochs.entry(pair.clone()).or_insert(0);
        *epoch += 1;
        self.current.remove(&pair);
        drop(epoch);
    }

    /// Evicts every entry of a tenant, or of one purpose. Returns how many
    /// key versions were dropped.
    pub fn clear(&self, tenant_id: &str, purpose: Option<EncryptionPurpose>) -> usize {
        let matches =
            |t: &str, p: EncryptionPurpose| t == tenant_id && purpose.is_none_or(|only| only == p);

        let before = self.entries.len();
        self.entries.retain(|(t, p, _), _| !matches(t, *p));
        let removed = before.saturating_sub(self.entries.len());

        let pairs: Vec<PairKey> = match purpose {
            Some(p) => vec![(tenant_id.to_string(), p)],
            None => EncryptionPurpose::ALL
                .iter()
                .map(|p| (tenant_id.to_string(), *p))
                .collect(),
        };
        for (t, p) in pairs {
            self.invalidate_current(&t, p);
        }

        removed
    }

    /// Read-only snapshot; does not touch recency, expiry or counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let memory_usage = self
            .entries
            .iter()
            .map(|entry| {
                entry.key().0.len() + entry.value().key.as_bytes().len() + std::mem::size_of::<CachedKey>()
            })
            .sum();

        CacheStats {
            size: self.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            memory_usage,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            capacity: self.config.capacity,
        }
    }
}

impl Default for OperationCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    fn key() -> Arc<DecryptedDataKey> {
        Arc::new(DecryptedDataKey::generate())
    }

    fn cache_with(capacity: usize, entry_ttl: Option<Duration>) -> OperationCache {
        OperationCache::new(CacheConfig {
            enabled: true,
            capacity,
            entry_ttl,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_hit_and_miss_are_counted() {
        let cache = cache_with(8, None);
        let k = key();
        cache.insert("t1", EncryptionPurpose::General, 1, k.clone());

        assert_eq!(cache.get("t1", EncryptionPurpose::General, 1), Some(k));
        assert!(cache.get("t1", EncryptionPurpose::General, 2).is_none());

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert!(stats.memory_usage > 0);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = cache_with(2, None);
        cache.insert("t1", EncryptionPurpose::General, 1, key());
        cache.insert("t1", EncryptionPurpose::General, 2, key());

        // touch version 1 so version 2 is the eviction candidate
        assert!(cache.get("t1", EncryptionPurpose::General, 1).is_some());
        cache.insert("t1", EncryptionPurpose::General, 3, key());

        assert!(cache.get("t1", EncryptionPurpose::General, 1).is_some());
        assert!(cache.get("t1", EncryptionPurpose::General, 2).is_none());
        assert!(cache.get("t1", EncryptionPurpose::General, 3).is_some());

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = cache_with(8, Some(Duration::from_millis(0)));
        cache.insert("t1", EncryptionPurpose::Pii, 1, key());

        assert!(cache.get("t1", EncryptionPurpose::Pii, 1).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_stats_does_not_mutate() {
        let cache = cache_with(8, Some(Duration::from_millis(0)));
        cache.insert("t1", EncryptionPurpose::Pii, 1, key());

        let first = cache.stats();
        let second = cache.stats();
        assert_eq!(first, second);
        assert_eq!(first.size, 1, "expired entries are only dropped on lookup");
        assert_eq!(first.hits + first.misses, 0);
    }

    #[test]
    fn test_stale_current_pointer_is_rejected_after_invalidation() {
        let cache = cache_with(8, None);

        let observed = cache.epoch("t1", EncryptionPurpose::General);
        // a rotation lands between the repository read and the install
        cache.invalidate_current("t1", EncryptionPurpose::General);

        assert!(!cache.put_current("t1", EncryptionPurpose::General, 1, observed));
        assert_eq!(cache.current_version("t1", EncryptionPurpose::General), None);

        let fresh = cache.epoch("t1", EncryptionPurpose::General);
        assert!(cache.put_current("t1", EncryptionPurpose::General, 2, fresh));
        assert_eq!(cache.current_version("t1", EncryptionPurpose::General), Some(2));
    }

    #[test]
    fn test_current_pointer_lapses_after_its_ttl() {
        let cache = OperationCache::new(CacheConfig {
            current_ttl: Duration::from_millis(0),
            ..CacheConfig::default()
        });
        cache.insert("t1", EncryptionPurpose::General, 1, key());
        let epoch = cache.epoch("t1", EncryptionPurpose::General);
        assert!(cache.put_current("t1", EncryptionPurpose::General, 1, epoch));

        assert_eq!(cache.current_version("t1", EncryptionPurpose::General), None);
        // the version entry itself has no TTL and stays usable
        assert!(cache.get("t1", EncryptionPurpose::General, 1).is_some());
    }

    #[test]
    fn test_current_pointer_is_trusted_within_its_ttl() {
        let cache = cache_with(8, None);
        let epoch = cache.epoch("t1", EncryptionPurpose::Audit);
        assert!(cache.put_current("t1", EncryptionPurpose::Audit, 4, epoch));
        assert_eq!(cache.current_version("t1", EncryptionPurpose::Audit), Some(4));
    }

    #[test]
    fn test_clear_by_tenant_and_purpose() {
        let cache = cache_with(16, None);
        for purpose in EncryptionPurpose::ALL {
            cache.insert("t1", purpose, 1, key());
            cache.insert("t2", purpose, 1, key());
        }
        cache.put_current("t1", EncryptionPurpose::Pii, 1, cache.epoch("t1", EncryptionPurpose::Pii));

        assert_eq!(cache.clear("t1", Some(EncryptionPurpose::Pii)), 1);
        assert_eq!(cache.current_version("t1", EncryptionPurpose::Pii), None);
        assert!(cache.get("t1", EncryptionPurpose::General, 1).is_some());

        assert_eq!(cache.clear("t1", None), 4);
        assert!(cache.get("t2", EncryptionPurpose::Pii, 1).is_some());
        assert_eq!(cache.stats().size, 5);
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache = OperationCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.insert("t1", EncryptionPurpose::General, 1, key());

        assert!(cache.get("t1", EncryptionPurpose::General, 1).is_none());
        assert!(!cache.put_current("t1", EncryptionPurpose::General, 1, 0));
        assert_eq!(cache.stats().size, 0);
    }
}

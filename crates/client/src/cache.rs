//! Fallback response cache: bounded LRU with per-entry TTL.
//!
//! The cache backs graceful degradation, not freshness: entries past their
//! TTL are still returned by [`get`](FallbackCache::get) so that a stale
//! response can be served while the remote service is unavailable. Expired
//! entries only disappear through eviction, [`delete`](FallbackCache::delete),
//! [`clear`](FallbackCache::clear) or an explicit
//! [`cleanup`](FallbackCache::cleanup) sweep.

use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use snafu::ensure;
use tracing::debug;

use crate::error::{ConfigSnafu, InvalidCacheKeySnafu, Result};

/// Capacity bounds.
pub(crate) const MIN_CACHE_SIZE: usize = 1;
pub(crate) const MAX_CACHE_SIZE: usize = 100_000;

/// Per-entry TTL bounds.
pub(crate) const MIN_CACHE_TTL: Duration = Duration::from_millis(10);
pub(crate) const MAX_CACHE_TTL: Duration = Duration::from_millis(86_400_000);

/// A cached response stamped with its insertion time and TTL.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Bounded LRU cache holding fallback responses for one service.
#[derive(Debug)]
pub struct FallbackCache {
    service_name: String,
    default_ttl: Duration,
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl FallbackCache {
    /// Creates a cache for the named service.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the service name is empty after
    /// trimming, `max_size` is outside `[1, 100_000]`, or `default_ttl` is
    /// outside `[10ms, 24h]`.
    pub fn new(service_name: &str, max_size: usize, default_ttl: Duration) -> Result<Self> {
        ensure!(
            !service_name.trim().is_empty(),
            ConfigSnafu { message: "cache service name cannot be empty" }
        );
        ensure!(
            (MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&max_size),
            ConfigSnafu {
                message: format!(
                    "max_cache_size {max_size} outside [{MIN_CACHE_SIZE}, {MAX_CACHE_SIZE}]"
                )
            }
        );
        validate_ttl(default_ttl)?;

        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            service_name: service_name.to_owned(),
            default_ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Inserts or refreshes an entry, evicting the least-recently-used one
    /// when the cache is full.
    ///
    /// Re-inserting an existing key refreshes both its recency and its
    /// insertion timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid key or an out-of-bounds `ttl`.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let ttl = match ttl {
            Some(ttl) => {
                validate_ttl(ttl)?;
                ttl
            }
            None => self.default_ttl,
        };

        let entry = CacheEntry { value, inserted_at: Instant::now(), ttl };
        let mut entries = self.entries.lock();
        if let Some((evicted_key, _)) = entries.push(key.to_owned(), entry) {
            if evicted_key != key {
                debug!(
                    service = %self.service_name,
                    key = %evicted_key,
                    "evicted least-recently-used cache entry"
                );
            }
        }
        Ok(())
    }

    /// Returns the cached value for `key`, refreshing its recency.
    ///
    /// Entries past their TTL are still returned; a debug event records the
    /// stale serve. Returns `None` only when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid key.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            debug!(
                service = %self.service_name,
                key = %key,
                age_ms = entry.inserted_at.elapsed().as_millis() as u64,
                "cache entry past TTL, returning stale value"
            );
        }
        Ok(Some(entry.value.clone()))
    }

    /// Returns whether `key` is present, regardless of expiry. Does not
    /// update recency.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    /// Removes an entry, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Purges entries strictly past their TTL, returning how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(
                service = %self.service_name,
                removed = expired.len(),
                "purged expired cache entries"
            );
        }
        expired.len()
    }

    /// Number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A key is valid unless it is empty after trimming. Interior whitespace is
/// allowed.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    ensure!(
        !key.trim().is_empty(),
        InvalidCacheKeySnafu { message: "key cannot be empty or all whitespace" }
    );
    Ok(())
}

fn validate_ttl(ttl: Duration) -> Result<()> {
    ensure!(
        (MIN_CACHE_TTL..=MAX_CACHE_TTL).contains(&ttl),
        ConfigSnafu {
            message: format!(
                "cache TTL {}ms outside [{}ms, {}ms]",
                ttl.as_millis(),
                MIN_CACHE_TTL.as_millis(),
                MAX_CACHE_TTL.as_millis()
            )
        }
    );
    Ok(())
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8),
        Get(u8),
        Delete(u8),
        Cleanup,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::Set),
            any::<u8>().prop_map(Op::Get),
            any::<u8>().prop_map(Op::Delete),
            Just(Op::Cleanup),
        ]
    }

    proptest! {
        /// The LRU bound holds for every interleaving of operations.
        #[test]
        fn prop_size_bounded(
            max_size in 1usize..8,
            ops in proptest::collection::vec(op(), 0..128)
        ) {
            let cache =
                FallbackCache::new("svc", max_size, Duration::from_secs(60)).unwrap();
            for op in ops {
                match op {
                    Op::Set(k) => cache.set(&format!("k{k}"), json!(k), None).unwrap(),
                    Op::Get(k) => {
                        let _ = cache.get(&format!("k{k}")).unwrap();
                    }
                    Op::Delete(k) => {
                        let _ = cache.delete(&format!("k{k}"));
                    }
                    Op::Cleanup => {
                        let _ = cache.cleanup();
                    }
                }
                prop_assert!(cache.len() <= max_size);
            }
        }

        /// A value written is readable back until deleted, even long past
        /// its TTL (stale-allow semantics).
        #[test]
        fn prop_written_values_stay_readable(keys in proptest::collection::vec(0u8..16, 1..16)) {
            let cache = FallbackCache::new("svc", 16, Duration::from_secs(60)).unwrap();
            for k in &keys {
                cache.set(&format!("k{k}"), json!(k), None).unwrap();
            }
            for k in &keys {
                prop_assert_eq!(cache.get(&format!("k{k}")).unwrap(), Some(json!(k)));
            }
        }
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct ConversionCacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for ConversionCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_ref: String,
    pub format: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Bytes,
    created_at: Instant,
    last_access: Instant,
    access_count: u64,
}

/// Per-entry metadata exposed for observability and tests.
#[derive(Debug, Clone)]
pub struct CacheEntryStats {
    pub key: CacheKey,
    pub access_count: u64,
    pub age: Duration,
    pub idle: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub len: usize,
    pub max_entries: usize,
    pub ttl: Duration,
    pub entries: Vec<CacheEntryStats>,
}

/// Memoizes derived format conversions, keyed by (source reference, target
/// format). Entries expire after the TTL and eviction removes the entry with
/// the lowest access count first, ties broken by oldest last access, so
/// reused entries outlive merely-recent ones.
///
/// Accessed from a single scheduler loop; a multi-threaded caller wraps it
/// in a mutex. The caller passes `now` so expiry is deterministic in tests.
#[derive(Debug)]
pub struct ConversionCache {
    config: ConversionCacheConfig,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl ConversionCache {
    pub fn new(config: ConversionCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, source_ref: &str, format: &str, now: Instant) -> Option<Bytes> {
        let key = CacheKey {
            source_ref: source_ref.to_string(),
            format: format.to_string(),
        };
        let expired = self.entries.get(&key).map(|entry| self.is_expired(entry, now))?;
        if expired {
            self.entries.remove(&key);
            return None;
        }
        let entry = self.entries.get_mut(&key)?;
        entry.last_access = now;
        entry.access_count += 1;
        Some(entry.payload.clone())
    }

    pub fn insert(&mut self, source_ref: &str, format: &str, payload: Bytes, now: Instant) {
        if self.config.max_entries == 0 || self.config.ttl.is_zero() {
            return;
        }
        let key = CacheKey {
            source_ref: source_ref.to_string(),
            format: format.to_string(),
        };
        let entry = CacheEntry {
            payload,
            created_at: now,
            last_access: now,
            access_count: 0,
        };
        if self.entries.contains_key(&key) {
            self.entries.insert(key, entry);
            return;
        }
        if self.entries.len() >= self.config.max_entries {
            self.evict_one();
        }
        self.entries.insert(key, entry);
    }

    /// Full sweep of expired entries, intended for a periodic timer so
    /// memory is reclaimed even for entries nobody queries again.
    pub fn cleanup(&mut self, now: Instant) {
        let before = self.entries.len();
        let ttl = self.config.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.created_at) < ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "swept expired conversions");
        }
    }

    pub fn stats(&self, now: Instant) -> CacheStats {
        CacheStats {
            len: self.entries.len(),
            max_entries: self.config.max_entries,
            ttl: self.config.ttl,
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| CacheEntryStats {
                    key: key.clone(),
                    access_count: entry.access_count,
                    age: now.duration_since(entry.created_at),
                    idle: now.duration_since(entry.last_access),
                })
                .collect(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.created_at) >= self.config.ttl
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.access_count
                    .cmp(&b.access_count)
                    .then(a.last_access.cmp(&b.last_access))
            })
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            tracing::debug!(source_ref = %key.source_ref, format = %key.format, "evicted conversion entry");
            self.entries.remove(&key);
        }
    }
}

impl Default for ConversionCache {
    fn default() -> Self {
        Self::new(ConversionCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, ttl_secs: u64) -> ConversionCache {
        ConversionCache::new(ConversionCacheConfig {
            max_entries,
            ttl: Duration::from_secs(ttl_secs),
        })
    }

    #[test]
    fn get_after_insert_round_trips() {
        let mut cache = cache(4, 60);
        let now = Instant::now();
        cache.insert("blob:1", "webp", Bytes::from_static(b"webp bytes"), now);
        assert_eq!(
            cache.get("blob:1", "webp", now),
            Some(Bytes::from_static(b"webp bytes"))
        );
        // Different format is a distinct key.
        assert_eq!(cache.get("blob:1", "png", now), None);
    }

    #[test]
    fn expired_entry_is_a_miss_and_removed() {
        let mut cache = cache(4, 60);
        let now = Instant::now();
        cache.insert("blob:1", "webp", Bytes::from_static(b"x"), now);

        let later = now + Duration::from_secs(61);
        assert_eq!(cache.get("blob:1", "webp", later), None);
        assert_eq!(cache.stats(later).len, 0);
    }

    #[test]
    fn eviction_prefers_lowest_access_count() {
        let mut cache = cache(2, 60);
        let now = Instant::now();
        cache.insert("a", "png", Bytes::from_static(b"a"), now);
        cache.insert("b", "png", Bytes::from_static(b"b"), now);

        // "a" is reused, "b" never is.
        assert!(cache.get("a", "png", now).is_some());

        cache.insert("c", "png", Bytes::from_static(b"c"), now);
        assert_eq!(cache.get("b", "png", now), None);
        assert!(cache.get("a", "png", now).is_some());
        assert!(cache.get("c", "png", now).is_some());
    }

    #[test]
    fn eviction_tie_breaks_on_oldest_last_access() {
        let mut cache = cache(2, 600);
        let now = Instant::now();
        cache.insert("a", "png", Bytes::from_static(b"a"), now);
        cache.insert("b", "png", Bytes::from_static(b"b"), now);

        // Equal access counts; touch both so last-access differs.
        assert!(cache.get("a", "png", now + Duration::from_secs(1)).is_some());
        assert!(cache.get("b", "png", now + Duration::from_secs(2)).is_some());

        cache.insert("c", "png", Bytes::from_static(b"c"), now + Duration::from_secs(3));
        let later = now + Duration::from_secs(4);
        assert_eq!(cache.get("a", "png", later), None);
        assert!(cache.get("b", "png", later).is_some());
    }

    #[test]
    fn cleanup_sweeps_all_expired_entries() {
        let mut cache = cache(8, 60);
        let now = Instant::now();
        cache.insert("a", "png", Bytes::from_static(b"a"), now);
        cache.insert("b", "png", Bytes::from_static(b"b"), now + Duration::from_secs(30));

        cache.cleanup(now + Duration::from_secs(61));
        let stats = cache.stats(now + Duration::from_secs(61));
        assert_eq!(stats.len, 1);
        assert_eq!(stats.entries[0].key.source_ref, "b");
    }

    #[test]
    fn stats_reports_access_metadata() {
        let mut cache = cache(4, 600);
        let now = Instant::now();
        cache.insert("a", "png", Bytes::from_static(b"a"), now);
        assert!(cache.get("a", "png", now + Duration::from_secs(5)).is_some());

        let stats = cache.stats(now + Duration::from_secs(10));
        assert_eq!(stats.len, 1);
        assert_eq!(stats.max_entries, 4);
        assert_eq!(stats.ttl, Duration::from_secs(600));
        assert_eq!(stats.entries[0].access_count, 1);
        assert_eq!(stats.entries[0].age, Duration::from_secs(10));
        assert_eq!(stats.entries[0].idle, Duration::from_secs(5));
    }
}

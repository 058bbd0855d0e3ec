//! Content and settings keyed result cache

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CacheConfig;
use crate::types::{DetectionSettings, SymbolDetectionResult};

/// `(documentContentHash, pageNumber, settingsHash)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub document_hash: String,
    pub page_number: u32,
    pub settings_hash: String,
}

impl CacheKey {
    pub fn new(document: &[u8], page_number: u32, settings: &DetectionSettings) -> Self {
        Self {
            document_hash: content_hash(document),
            page_number,
            settings_hash: settings_hash(settings),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            &self.document_hash[..self.document_hash.len().min(12)],
            self.page_number,
            &self.settings_hash[..self.settings_hash.len().min(12)]
        )
    }
}

/// Hex SHA-256 of the raw document bytes
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of the settings' canonical JSON form
pub fn settings_hash(settings: &DetectionSettings) -> String {
    let canonical = serde_json::to_vec(settings).unwrap_or_else(|_| format!("{:?}", settings).into_bytes());
    content_hash(&canonical)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
    pub expirations: u64,
}

/// Result cache consulted before a job enters processing
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<SymbolDetectionResult>;
    fn put(&self, key: CacheKey, result: SymbolDetectionResult);
    fn stats(&self) -> CacheStats;
    fn clear(&self);
}

struct Entry {
    inserted: Instant,
    result: SymbolDetectionResult,
}

#[derive(Default)]
struct TtlState {
    entries: HashMap<CacheKey, Entry>,
    /// Insertion order, oldest first
    order: VecDeque<CacheKey>,
    stats: CacheStats,
}

/// Capacity-bounded cache with per-entry expiry. The oldest insertion is
/// evicted first when full.
pub struct TtlCache {
    state: Mutex<TtlState>,
    capacity: usize,
    ttl: Duration,
}

impl TtlCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(TtlState::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.ttl_secs))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultCache for TtlCache {
    fn get(&self, key: &CacheKey) -> Option<SymbolDetectionResult> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.inserted.elapsed() >= self.ttl,
        };

        if expired {
            state.entries.remove(key);
            state.order.retain(|k| k != key);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            debug!("Cache entry {} expired", key);
            return None;
        }

        state.stats.hits += 1;
        state.entries.get(key).map(|e| e.result.clone())
    }

    fn put(&self, key: CacheKey, result: SymbolDetectionResult) {
        let mut state = self.state.lock();
        if state.entries.contains_key(&key) {
            state.order.retain(|k| k != &key);
        }
        while state.entries.len() >= self.capacity && !state.entries.contains_key(&key) {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            state.stats.evictions += 1;
        }
        state.order.push_back(key.clone());
        state.entries.insert(
            key,
            Entry {
                inserted: Instant::now(),
                result,
            },
        );
    }

    fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionMetadata;

    fn result(doc: &str) -> SymbolDetectionResult {
        SymbolDetectionResult::new(doc, 1, Vec::new(), 10, DetectionMetadata::default())
    }

    fn key(doc: &[u8]) -> CacheKey {
        CacheKey::new(doc, 1, &DetectionSettings::default())
    }

    #[test]
    fn test_key_depends_on_content_page_and_settings() {
        let settings = DetectionSettings::default();
        let a = CacheKey::new(b"page", 1, &settings);
        assert_eq!(a, CacheKey::new(b"page", 1, &settings));
        assert_ne!(a, CacheKey::new(b"page!", 1, &settings));
        assert_ne!(a, CacheKey::new(b"page", 2, &settings));

        let stricter = DetectionSettings {
            confidence_threshold: 0.7,
            ..settings
        };
        assert_ne!(a, CacheKey::new(b"page", 1, &stricter));
        assert_eq!(a.document_hash.len(), 64);
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        assert!(cache.get(&key(b"a")).is_none());
        let stored = result("a");
        cache.put(key(b"a"), stored.clone());
        assert_eq!(cache.get(&key(b"a")), Some(stored));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = TtlCache::new(4, Duration::ZERO);
        cache.put(key(b"a"), result("a"));
        assert!(cache.get(&key(b"a")).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest_insert() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.put(key(b"a"), result("a"));
        cache.put(key(b"b"), result("b"));
        cache.put(key(b"c"), result("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(b"a")).is_none());
        assert!(cache.get(&key(b"c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.put(key(b"a"), result("a"));
        cache.put(key(b"b"), result("b"));
        cache.put(key(b"a"), result("a2"));
        cache.put(key(b"c"), result("c"));
        assert!(cache.get(&key(b"b")).is_none());
        assert_eq!(cache.get(&key(b"a")).map(|r| r.document_id), Some("a2".to_string()));
    }
}

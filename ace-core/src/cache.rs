//! Analysis result cache.
//!
//! Results are memoized under a deterministic projection of
//! `(observable.type, observable.value, observable.time?, amt.name,
//! amt.version, extended_cache_keys...)`, hashed to a short hex string. The
//! cached value is the `(before, after)` root pair whose diff is replayed
//! onto other roots carrying the same observable. The cache is advisory:
//! losing it costs throughput, never correctness.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::model::{AnalysisModuleType, ObservableId, RootAnalysis};

/// Deterministic cache key for `(observable, module type)`, or `None` when
/// the module type does not cache.
#[must_use]
pub fn generate_cache_key(observable: &ObservableId, amt: &AnalysisModuleType) -> Option<String> {
    amt.cache_ttl?;

    let mut hasher = Sha256::new();
    hasher.update(observable.observable_type.as_bytes());
    hasher.update([0]);
    hasher.update(observable.value.as_bytes());
    hasher.update([0]);
    if let Some(time) = observable.time {
        hasher.update(time.to_rfc3339().as_bytes());
    }
    hasher.update([0]);
    hasher.update(amt.name.as_bytes());
    hasher.update([0]);
    hasher.update(amt.version.as_bytes());
    for key in &amt.extended_cache_keys {
        hasher.update([0]);
        hasher.update(key.as_bytes());
    }

    Some(format!("{:x}", hasher.finalize()))
}

/// A cached `(before, after)` result pair.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub root_before: RootAnalysis,
    pub root_after: RootAnalysis,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: Option<u64>,
}

impl CachedResult {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs {
            Some(ttl) => now >= self.created_at + Duration::seconds(ttl as i64),
            None => false,
        }
    }
}

/// Keyed result memoization with lazy expiry.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: DashMap<String, CachedResult>,
    // key = module type name, value = cache keys written for that module
    by_amt: DashMap<String, Vec<String>>,
}

impl ResultCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_amt: DashMap::new(),
        }
    }

    /// Look up a cached pair. An expired entry is a miss and is removed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedResult> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => entry.is_expired(Utc::now()),
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Store a result pair. Best-effort idempotent: re-storing under the
    /// same key replaces the entry.
    pub fn put(
        &self,
        key: impl Into<String>,
        amt_name: &str,
        root_before: RootAnalysis,
        root_after: RootAnalysis,
        ttl_secs: Option<u64>,
    ) {
        let key = key.into();
        self.entries.insert(
            key.clone(),
            CachedResult {
                root_before,
                root_after,
                created_at: Utc::now(),
                ttl_secs,
            },
        );
        self.by_amt
            .entry(amt_name.to_string())
            .or_default()
            .push(key);
    }

    /// Drop all entries written for the given module type name.
    pub fn invalidate_module(&self, amt_name: &str) {
        if let Some((_, keys)) = self.by_amt.remove(amt_name) {
            for key in keys {
                self.entries.remove(&key);
            }
        }
    }

    /// Remove every expired entry.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached_amt() -> AnalysisModuleType {
        AnalysisModuleType::new("amt_whois", "1.0.0").with_cache_ttl(3600)
    }

    #[test]
    fn key_is_none_without_cache_ttl() {
        let amt = AnalysisModuleType::new("amt_a", "1.0.0");
        let id = ObservableId::new("ipv4", "8.8.8.8");
        assert!(generate_cache_key(&id, &amt).is_none());
    }

    #[test]
    fn key_is_deterministic_and_version_sensitive() {
        let id = ObservableId::new("ipv4", "8.8.8.8");
        let v1 = generate_cache_key(&id, &cached_amt()).unwrap();
        let v1_again = generate_cache_key(&id, &cached_amt()).unwrap();
        assert_eq!(v1, v1_again);

        let v2 = generate_cache_key(
            &id,
            &AnalysisModuleType::new("amt_whois", "2.0.0").with_cache_ttl(3600),
        )
        .unwrap();
        assert_ne!(v1, v2);
    }

    #[test]
    fn extended_keys_change_the_projection() {
        let id = ObservableId::new("ipv4", "8.8.8.8");
        let mut amt = cached_amt();
        let plain = generate_cache_key(&id, &amt).unwrap();

        amt.extended_cache_keys = vec!["intel-feed:v7".to_string()];
        let extended = generate_cache_key(&id, &amt).unwrap();
        assert_ne!(plain, extended);
    }

    #[test]
    fn expired_entries_miss_and_vanish() {
        let cache = ResultCache::new();
        let root = RootAnalysis::new();
        cache.put("k", "amt_whois", root.clone(), root, Some(0));

        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn module_invalidation_drops_entries() {
        let cache = ResultCache::new();
        let root = RootAnalysis::new();
        cache.put("k1", "amt_whois", root.clone(), root.clone(), Some(3600));
        cache.put("k2", "amt_other", root.clone(), root, Some(3600));

        cache.invalidate_module("amt_whois");
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
    }
}

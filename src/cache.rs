//! In-memory correlation cache
//!
//! Deduplicates correlation updates: tracks which (dimension, service or
//! environment) associations have already been sent to the backend, when
//! they were last confirmed, and which updates are still in flight. Bounded
//! by entry count and by a time-to-live on unobserved entries.

use crate::types::{Association, DimensionKey};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One cache entry: everything known about a single dimension key
#[derive(Debug)]
struct CorrelationEntry {
    /// Service names confirmed or in flight for this dimension
    services: HashSet<String>,

    /// Environment names confirmed or in flight for this dimension
    environments: HashSet<String>,

    /// Last time a correlation for this entry was confirmed by the backend
    last_confirmed: Instant,

    /// Last time the dimension was observed in a trace batch
    last_observed: Instant,

    /// Insertion sequence, tie-break for eviction ordering
    seq: u64,

    /// Outstanding correlation requests referencing this entry.
    /// The entry is "dirty" while this is non-zero.
    pending: u32,
}

impl CorrelationEntry {
    fn dirty(&self) -> bool {
        self.pending > 0
    }

    fn insert(&mut self, association: &Association) -> bool {
        match association {
            Association::Service(s) => self.services.insert(s.clone()),
            Association::Environment(e) => self.environments.insert(e.clone()),
        }
    }

    fn associations(&self, key: &DimensionKey) -> Vec<(DimensionKey, Association)> {
        self.services
            .iter()
            .map(|s| (key.clone(), Association::Service(s.clone())))
            .chain(
                self.environments
                    .iter()
                    .map(|e| (key.clone(), Association::Environment(e.clone()))),
            )
            .collect()
    }
}

struct CacheInner {
    entries: HashMap<DimensionKey, CorrelationEntry>,
    next_seq: u64,
}

/// Thread-safe, bounded correlation cache.
///
/// One coarse lock guards the entry map; every operation does in-memory
/// bookkeeping only, so the critical sections are short and never span
/// network calls.
pub struct CorrelationCache {
    stale_timeout: Duration,
    entry_ttl: Duration,
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

impl CorrelationCache {
    /// Create a cache with the given staleness window, entry TTL and capacity
    pub fn new(stale_timeout: Duration, entry_ttl: Duration, max_entries: usize) -> Self {
        Self {
            stale_timeout,
            entry_ttl,
            max_entries,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Record an observation of `association` for `key`.
    ///
    /// Returns `true` when the observation carries new information: the key
    /// was unknown, the association value was unknown, or the entry's last
    /// confirmation has aged past the staleness window. A `true` return
    /// marks the entry dirty; the caller must follow up with a submission
    /// (or [`confirm`](Self::confirm) with `success = false` if it cannot).
    pub fn observe(&self, key: &DimensionKey, association: &Association) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_observed = now;

            let new_value = entry.insert(association);
            let stale = !new_value
                && !entry.dirty()
                && now.duration_since(entry.last_confirmed) > self.stale_timeout;

            if new_value || stale {
                entry.pending += 1;
                debug!(
                    key = %key,
                    association = %association,
                    stale,
                    "correlation update needed"
                );
                return true;
            }
            return false;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut entry = CorrelationEntry {
            services: HashSet::new(),
            environments: HashSet::new(),
            last_confirmed: now,
            last_observed: now,
            seq,
            pending: 1,
        };
        entry.insert(association);
        inner.entries.insert(key.clone(), entry);
        debug!(key = %key, association = %association, "new correlation entry");

        // Keep capacity bounded on the insert path.
        Self::enforce_capacity(&mut inner, self.max_entries);
        true
    }

    /// Terminal outcome for an outstanding request referencing `key`.
    ///
    /// Clears one pending slot; on success refreshes the last-confirmed
    /// timestamp. On failure the association stays recorded but eligible for
    /// re-submission once observed again past the staleness window.
    pub fn confirm(&self, key: &DimensionKey, success: bool) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            // Entry expired while the request was in flight; nothing to do.
            return;
        };
        entry.pending = entry.pending.saturating_sub(1);
        if success {
            entry.last_confirmed = Instant::now();
        }
    }

    /// Forget a failed association so the next observation re-submits it.
    ///
    /// Used after permanent rejections: leaving the value in the set would
    /// suppress resubmission until the staleness window elapses.
    pub fn forget(&self, key: &DimensionKey, association: &Association) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            match association {
                Association::Service(s) => entry.services.remove(s),
                Association::Environment(e) => entry.environments.remove(e),
            };
        }
    }

    /// Remove expired and over-capacity entries.
    ///
    /// Entries unobserved for longer than the TTL are removed and their
    /// associations returned so the caller can issue disassociate requests.
    /// Capacity overflow is then trimmed silently, oldest last-confirmed
    /// first (ties by insertion order) — those correlations are still valid,
    /// only the local memory of them is dropped. Dirty entries are never
    /// evicted.
    pub fn evict(&self) -> Vec<(DimensionKey, Association)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired_keys: Vec<DimensionKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                !entry.dirty() && now.duration_since(entry.last_observed) >= self.entry_ttl
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut expired = Vec::new();
        for key in expired_keys {
            if let Some(entry) = inner.entries.remove(&key) {
                expired.extend(entry.associations(&key));
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired correlations scheduled for removal");
        }

        Self::enforce_capacity(&mut inner, self.max_entries);
        expired
    }

    /// Number of entries currently cached
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether an entry exists for `key`
    pub fn contains(&self, key: &DimensionKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Whether the entry for `key` has requests outstanding
    pub fn is_dirty(&self, key: &DimensionKey) -> bool {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(CorrelationEntry::dirty)
            .unwrap_or(false)
    }

    fn enforce_capacity(inner: &mut CacheInner, max_entries: usize) {
        while inner.entries.len() > max_entries {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, entry)| !entry.dirty())
                .min_by_key(|(_, entry)| (entry.last_confirmed, entry.seq))
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    inner.entries.remove(&key);
                    debug!(key = %key, "correlation entry evicted, capacity exceeded");
                }
                None => {
                    warn!(
                        len = inner.entries.len(),
                        max_entries, "cache over capacity but all entries have requests in flight"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn key(value: &str) -> DimensionKey {
        DimensionKey::new("host", value)
    }

    fn service(name: &str) -> Association {
        Association::Service(name.to_string())
    }

    fn roomy_cache() -> CorrelationCache {
        CorrelationCache::new(Duration::from_secs(300), Duration::from_secs(3600), 100)
    }

    #[test]
    fn test_observe_new_key_is_new_information() {
        let cache = roomy_cache();
        assert!(cache.observe(&key("a"), &service("svc")));
        assert_eq!(cache.len(), 1);
        assert!(cache.is_dirty(&key("a")));
    }

    #[test]
    fn test_observe_is_idempotent_within_stale_window() {
        let cache = roomy_cache();
        assert!(cache.observe(&key("a"), &service("svc")));
        cache.confirm(&key("a"), true);
        assert!(!cache.observe(&key("a"), &service("svc")));
        assert!(!cache.observe(&key("a"), &service("svc")));
        assert!(!cache.is_dirty(&key("a")));
    }

    #[test]
    fn test_observe_new_association_is_new_information() {
        let cache = roomy_cache();
        assert!(cache.observe(&key("a"), &service("svc")));
        assert!(cache.observe(&key("a"), &service("other")));
        assert!(cache.observe(&key("a"), &Association::Environment("prod".into())));
    }

    #[test]
    fn test_stale_entry_is_reobservable() {
        let cache = CorrelationCache::new(Duration::ZERO, Duration::from_secs(3600), 100);
        assert!(cache.observe(&key("a"), &service("svc")));
        cache.confirm(&key("a"), true);
        sleep(Duration::from_millis(5));
        assert!(cache.observe(&key("a"), &service("svc")));
    }

    #[test]
    fn test_stale_entry_not_reobserved_while_dirty() {
        let cache = CorrelationCache::new(Duration::ZERO, Duration::from_secs(3600), 100);
        assert!(cache.observe(&key("a"), &service("svc")));
        sleep(Duration::from_millis(5));
        // Still dirty: the first request has not been confirmed yet.
        assert!(!cache.observe(&key("a"), &service("svc")));
    }

    #[test]
    fn test_confirm_failure_leaves_entry_reobservable_when_stale() {
        let cache = CorrelationCache::new(Duration::ZERO, Duration::from_secs(3600), 100);
        assert!(cache.observe(&key("a"), &service("svc")));
        cache.confirm(&key("a"), false);
        sleep(Duration::from_millis(5));
        assert!(cache.observe(&key("a"), &service("svc")));
    }

    #[test]
    fn test_forget_allows_immediate_resubmission() {
        let cache = roomy_cache();
        assert!(cache.observe(&key("a"), &service("svc")));
        cache.confirm(&key("a"), false);
        cache.forget(&key("a"), &service("svc"));
        assert!(cache.observe(&key("a"), &service("svc")));
    }

    #[test]
    fn test_capacity_eviction_removes_oldest_confirmed_first() {
        let cache = CorrelationCache::new(Duration::from_secs(300), Duration::from_secs(3600), 2);
        cache.observe(&key("a"), &service("svc"));
        cache.confirm(&key("a"), true);
        sleep(Duration::from_millis(5));
        cache.observe(&key("b"), &service("svc"));
        cache.confirm(&key("b"), true);
        sleep(Duration::from_millis(5));
        cache.observe(&key("c"), &service("svc"));
        cache.confirm(&key("c"), true);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key("a")));
        assert!(cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
    }

    #[test]
    fn test_capacity_eviction_skips_dirty_entries() {
        let cache = CorrelationCache::new(Duration::from_secs(300), Duration::from_secs(3600), 2);
        // Oldest entry stays dirty: no confirm.
        cache.observe(&key("a"), &service("svc"));
        sleep(Duration::from_millis(5));
        cache.observe(&key("b"), &service("svc"));
        cache.confirm(&key("b"), true);
        sleep(Duration::from_millis(5));
        cache.observe(&key("c"), &service("svc"));
        cache.confirm(&key("c"), true);

        assert!(cache.contains(&key("a")), "dirty entry must survive eviction");
        assert!(!cache.contains(&key("b")));
    }

    #[test]
    fn test_ttl_eviction_reports_associations() {
        let cache = CorrelationCache::new(Duration::from_secs(300), Duration::ZERO, 100);
        cache.observe(&key("a"), &service("svc"));
        cache.confirm(&key("a"), true);
        cache.observe(&key("a"), &Association::Environment("prod".into()));
        cache.confirm(&key("a"), true);
        sleep(Duration::from_millis(5));

        let mut expired = cache.evict();
        expired.sort_by_key(|(_, a)| a.kind());

        assert_eq!(cache.len(), 0);
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].1, Association::Environment("prod".into()));
        assert_eq!(expired[1].1, service("svc"));
    }

    #[test]
    fn test_ttl_eviction_skips_dirty_entries() {
        let cache = CorrelationCache::new(Duration::from_secs(300), Duration::ZERO, 100);
        cache.observe(&key("a"), &service("svc"));
        sleep(Duration::from_millis(5));

        let expired = cache.evict();
        assert!(expired.is_empty());
        assert!(cache.contains(&key("a")));
    }

    #[test]
    fn test_evict_within_ttl_keeps_entries() {
        let cache = roomy_cache();
        cache.observe(&key("a"), &service("svc"));
        cache.confirm(&key("a"), true);

        let expired = cache.evict();
        assert!(expired.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_confirm_unknown_key_is_noop() {
        let cache = roomy_cache();
        cache.confirm(&key("ghost"), true);
        assert!(cache.is_empty());
    }
}

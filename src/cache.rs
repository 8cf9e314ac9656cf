//! Investigation results cached per time/host scope.
//!
//! The key covers only the time filter and host filter. Filters are checked
//! at read time instead: a cached entry is reused when the current filter set
//! contains every filter the entry was computed under (drill-in), and refused
//! when filters were removed (drill-out).
//!
//! Findings inside an entry are keyed by anomaly id, and ids hash the filter
//! set. Lookups therefore take the anomaly's window and category and rebuild
//! the id under the filters the entry was written with.
//!
//! Store failures never reach the caller. A failed read is a miss and a
//! failed write is logged and dropped.

use crate::config::CacheConfig;
use crate::detect::{Category, TimeWindow};
use crate::filters::{is_superset, FilterMap, QueryContext};
use crate::identity::{generate_id, string_hash, to_base36, AnomalyId};
use crate::investigate::FacetFinding;
use crate::storage::{KvStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Bumped whenever the stored shape or the scoring changes.
pub const CACHE_VERSION: u32 = 3;
/// Namespace for every cache key.
pub const CACHE_PREFIX: &str = "trafficlens:investigation:";

const DEFAULT_TTL_SECS: i64 = 3600;
const DEFAULT_MAX_ENTRIES: usize = 10;

/// Ranked findings per anomaly within one scope.
pub type TopContributors = BTreeMap<AnomalyId, Vec<FacetFinding>>;

/// Stored value. `context` is absent in entries written before scoped
/// eligibility existed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub top_contributors: TopContributors,
    #[serde(default)]
    pub context: Option<QueryContext>,
    pub version: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Listing row for maintenance commands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub key: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub version: Option<u32>,
    pub anomalies: usize,
}

/// The anomaly an investigation explains, independent of the active filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyRef {
    pub window: TimeWindow,
    pub category: Category,
}

impl AnomalyRef {
    pub fn new(window: TimeWindow, category: Category) -> Self {
        Self { window, category }
    }

    /// Id of this anomaly under a time scope and filter set.
    pub fn id_under(&self, time_filter: &str, filters: &FilterMap) -> AnomalyId {
        generate_id(
            time_filter,
            &filters.canonical(),
            self.window.start,
            self.window.end,
            self.category.as_str(),
        )
    }
}

/// Whether a result cached under `cached` may answer a query under `current`.
pub fn is_cache_eligible(current: &QueryContext, cached: &QueryContext) -> bool {
    current.time_filter == cached.time_filter
        && current.host_filter == cached.host_filter
        && is_superset(&current.filter_map, &cached.filter_map)
}

pub struct InvestigationCache<S> {
    store: S,
    ttl: Duration,
    max_entries: usize,
}

impl<S: KvStore> InvestigationCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            ttl: Duration::seconds(DEFAULT_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn from_config(store: S, config: &CacheConfig) -> Self {
        Self {
            store,
            ttl: Duration::seconds(config.ttl_secs as i64),
            max_entries: config.max_entries,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Storage key for a scope: base-36 hash of `time_filter|host_filter`.
    pub fn key_for(context: &QueryContext) -> String {
        let scope = format!("{}|{}", context.time_filter, context.host_filter);
        format!("{}{}", CACHE_PREFIX, to_base36(string_hash(&scope).unsigned_abs()))
    }

    pub fn save(&self, context: &QueryContext, top_contributors: &TopContributors) {
        self.save_at(context, top_contributors, Utc::now());
    }

    pub fn save_at(&self, context: &QueryContext, top_contributors: &TopContributors, now: DateTime<Utc>) {
        let key = Self::key_for(context);
        let entry = CacheEntry {
            top_contributors: top_contributors.clone(),
            context: Some(context.clone()),
            version: CACHE_VERSION,
            timestamp: now.timestamp_millis(),
        };

        let written = serde_json::to_string(&entry)
            .map_err(StoreError::from)
            .and_then(|json| self.store.set(&key, &json));
        match written {
            Ok(()) => {
                debug!(%key, anomalies = top_contributors.len(), "cached investigation");
                self.prune();
            }
            Err(e) => warn!(%key, error = %e, "failed to write investigation cache"),
        }
    }

    pub fn load(&self, context: &QueryContext) -> Option<TopContributors> {
        self.load_at(context, Utc::now())
    }

    pub fn load_at(&self, context: &QueryContext, now: DateTime<Utc>) -> Option<TopContributors> {
        self.eligible_entry_at(context, now).map(|entry| entry.top_contributors)
    }

    /// Live, current-version entry for the scope that may answer `context`.
    fn eligible_entry_at(&self, context: &QueryContext, now: DateTime<Utc>) -> Option<CacheEntry> {
        let key = Self::key_for(context);
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%key, error = %e, "failed to read investigation cache");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%key, error = %e, "discarding malformed cache entry");
                self.discard(&key);
                return None;
            }
        };

        if entry.version != CACHE_VERSION {
            debug!(%key, version = entry.version, "discarding cache entry from another version");
            self.discard(&key);
            return None;
        }
        if now.timestamp_millis() - entry.timestamp > self.ttl.num_milliseconds() {
            debug!(%key, "discarding expired cache entry");
            self.discard(&key);
            return None;
        }

        match &entry.context {
            // Legacy entries carry no scope; the key match is all we can check.
            None => Some(entry),
            Some(cached) if is_cache_eligible(context, cached) => Some(entry),
            Some(_) => {
                debug!(%key, "cached investigation not eligible for current filters");
                None
            }
        }
    }

    /// Cached findings for one anomaly, if the scope entry is eligible.
    pub fn lookup(&self, context: &QueryContext, anomaly: &AnomalyRef) -> Option<Vec<FacetFinding>> {
        self.lookup_at(context, anomaly, Utc::now())
    }

    pub fn lookup_at(&self, context: &QueryContext, anomaly: &AnomalyRef, now: DateTime<Utc>) -> Option<Vec<FacetFinding>> {
        let mut entry = self.eligible_entry_at(context, now)?;
        let written_under = entry
            .context
            .as_ref()
            .map(|c| &c.filter_map)
            .unwrap_or(&context.filter_map);
        let id = anomaly.id_under(&context.time_filter, written_under);
        entry.top_contributors.remove(&id)
    }

    /// Store one anomaly's findings. They merge into the scope entry only
    /// when it was written under the same filters; otherwise the entry is
    /// replaced.
    pub fn record(&self, context: &QueryContext, anomaly: &AnomalyRef, findings: Vec<FacetFinding>) {
        self.record_at(context, anomaly, findings, Utc::now());
    }

    pub fn record_at(&self, context: &QueryContext, anomaly: &AnomalyRef, findings: Vec<FacetFinding>, now: DateTime<Utc>) {
        let mut top = match self.eligible_entry_at(context, now) {
            Some(entry) if entry.context.as_ref() == Some(context) => entry.top_contributors,
            _ => TopContributors::new(),
        };
        top.insert(anomaly.id_under(&context.time_filter, &context.filter_map), findings);
        self.save_at(context, &top, now);
    }

    /// Remove every entry in the namespace. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let keys = match self.store.keys(CACHE_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to enumerate investigation cache");
                return 0;
            }
        };
        keys.iter().filter(|key| self.discard(key)).count()
    }

    pub fn entries(&self) -> Vec<EntrySummary> {
        let keys = match self.store.keys(CACHE_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to enumerate investigation cache");
                return Vec::new();
            }
        };

        let mut entries: Vec<EntrySummary> = keys
            .into_iter()
            .map(|key| {
                let entry = self.read_entry(&key);
                EntrySummary {
                    timestamp: entry
                        .as_ref()
                        .and_then(|e| DateTime::from_timestamp_millis(e.timestamp)),
                    version: entry.as_ref().map(|e| e.version),
                    anomalies: entry.map(|e| e.top_contributors.len()).unwrap_or(0),
                    key,
                }
            })
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }

    fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let raw = self.store.get(key).ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    fn discard(&self, key: &str) -> bool {
        match self.store.remove(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(%key, error = %e, "failed to remove cache entry");
                false
            }
        }
    }

    /// Keep the `max_entries` most recent entries. Unreadable entries sort last.
    fn prune(&self) {
        let keys = match self.store.keys(CACHE_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to enumerate investigation cache");
                return;
            }
        };
        if keys.len() <= self.max_entries {
            return;
        }

        let mut stamped: Vec<(i64, String)> = keys
            .into_iter()
            .map(|key| {
                let ts = self.read_entry(&key).map(|e| e.timestamp).unwrap_or(i64::MIN);
                (ts, key)
            })
            .collect();
        stamped.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, key) in stamped.iter().skip(self.max_entries) {
            self.discard(key);
        }
        debug!(pruned = stamped.len() - self.max_entries, "pruned investigation cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{compile_filters, ActiveFilter};
    use crate::identity::generate_id;
    use crate::investigate::RateChange;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;

    fn finding(dim: &str) -> FacetFinding {
        FacetFinding {
            facet: "host".to_string(),
            dim: dim.to_string(),
            window_rate: 12.0,
            baseline_rate: 2.0,
            rate_change: RateChange::Percent(500.0),
            window_share: 40.0,
            baseline_share: 10.0,
            share_change: 30.0,
            error_rate_change: Some(1.5),
            error_share_change: None,
            significance: 30.0,
        }
    }

    fn ctx(filters: &[ActiveFilter]) -> QueryContext {
        QueryContext::new("last 1h", "", compile_filters(filters).map)
    }

    fn payload(dim: &str) -> TopContributors {
        let id = generate_id(
            "last 1h",
            "{}",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap(),
            "red",
        );
        BTreeMap::from([(id, vec![finding(dim)])])
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_eligibility_rules() {
        let cached = ctx(&[ActiveFilter::include("host", "a")]);

        assert!(is_cache_eligible(&cached, &cached));
        let drilled_in = ctx(&[ActiveFilter::include("host", "a"), ActiveFilter::include("status", "503")]);
        assert!(is_cache_eligible(&drilled_in, &cached));
        assert!(!is_cache_eligible(&ctx(&[]), &cached));

        let mut other_time = cached.clone();
        other_time.time_filter = "last 24h".to_string();
        assert!(!is_cache_eligible(&other_time, &cached));

        let mut other_host = cached.clone();
        other_host.host_filter = "`request.host` = 'b'".to_string();
        assert!(!is_cache_eligible(&other_host, &cached));
    }

    #[test]
    fn test_key_ignores_filters() {
        type Cache = InvestigationCache<MemoryStore>;
        let a = Cache::key_for(&ctx(&[]));
        let b = Cache::key_for(&ctx(&[ActiveFilter::include("host", "x")]));
        assert_eq!(a, b);
        assert!(a.starts_with(CACHE_PREFIX));

        let mut other = ctx(&[]);
        other.host_filter = "h".to_string();
        assert_ne!(a, Cache::key_for(&other));
    }

    #[test]
    fn test_drill_in_hits_and_drill_out_misses() {
        let cache = InvestigationCache::new(MemoryStore::new());
        let scoped = ctx(&[ActiveFilter::include("host", "a")]);
        cache.save_at(&scoped, &payload("a"), now());

        let narrower = ctx(&[ActiveFilter::include("host", "a"), ActiveFilter::exclude("status", "200")]);
        assert!(cache.load_at(&narrower, now()).is_some());
        assert!(cache.load_at(&scoped, now()).is_some());
        assert!(cache.load_at(&ctx(&[]), now()).is_none());
    }

    #[test]
    fn test_lookup_hits_after_drill_in_even_though_the_id_changes() {
        let cache = InvestigationCache::new(MemoryStore::new());
        let red = anomaly(Category::Red);
        let broad = ctx(&[]);
        cache.record_at(&broad, &red, vec![finding("origin-7")], now());

        // The id a caller computes after adding a filter differs from the one
        // the findings were stored under.
        let narrow = ctx(&[ActiveFilter::include("`client.country_name`", "NL")]);
        assert_ne!(
            red.id_under(&narrow.time_filter, &narrow.filter_map),
            red.id_under(&broad.time_filter, &broad.filter_map)
        );

        let hit = cache.lookup_at(&narrow, &red, now()).unwrap();
        assert_eq!(hit[0].dim, "origin-7");

        // Drilling back out of a narrower entry is still a miss.
        let fresh = InvestigationCache::new(MemoryStore::new());
        fresh.record_at(&narrow, &red, vec![finding("origin-7")], now());
        assert!(fresh.lookup_at(&broad, &red, now()).is_none());
        assert!(fresh.lookup_at(&narrow, &red, now()).is_some());
    }

    #[test]
    fn test_record_under_narrower_filters_replaces_entry() {
        let cache = InvestigationCache::new(MemoryStore::new());
        let broad = ctx(&[]);
        let narrow = ctx(&[ActiveFilter::include("host", "a")]);
        cache.record_at(&broad, &anomaly(Category::Red), vec![finding("a")], now());
        cache.record_at(&narrow, &anomaly(Category::Green), vec![finding("b")], now());

        let top = cache.load_at(&narrow, now()).unwrap();
        assert_eq!(top.len(), 1);
        assert!(cache.lookup_at(&narrow, &anomaly(Category::Green), now()).is_some());
        assert!(cache.lookup_at(&broad, &anomaly(Category::Red), now()).is_none());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = InvestigationCache::new(MemoryStore::new());
        let scope = ctx(&[]);
        cache.save_at(&scope, &payload("a"), now());

        assert!(cache.load_at(&scope, now() + Duration::minutes(59)).is_some());
        assert!(cache.load_at(&scope, now() + Duration::minutes(61)).is_none());
        // The expired entry was removed.
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_version_mismatch_invalidates() -> anyhow::Result<()> {
        let cache = InvestigationCache::new(MemoryStore::new());
        let scope = ctx(&[]);
        let stale = CacheEntry {
            top_contributors: payload("a"),
            context: Some(scope.clone()),
            version: CACHE_VERSION - 1,
            timestamp: now().timestamp_millis(),
        };
        let key = InvestigationCache::<MemoryStore>::key_for(&scope);
        cache.store().set(&key, &serde_json::to_string(&stale)?)?;
        assert!(cache.load_at(&scope, now()).is_none());
        Ok(())
    }

    #[test]
    fn test_legacy_entry_without_context_matches_by_key() -> anyhow::Result<()> {
        let cache = InvestigationCache::new(MemoryStore::new());
        let legacy = serde_json::json!({
            "top_contributors": {},
            "version": CACHE_VERSION,
            "timestamp": now().timestamp_millis(),
        });
        let with_filters = ctx(&[ActiveFilter::include("host", "a")]);
        let key = InvestigationCache::<MemoryStore>::key_for(&with_filters);
        cache.store().set(&key, &legacy.to_string())?;
        assert!(cache.load_at(&with_filters, now()).is_some());
        Ok(())
    }

    #[test]
    fn test_malformed_entry_is_a_miss() -> anyhow::Result<()> {
        let cache = InvestigationCache::new(MemoryStore::new());
        let scope = ctx(&[]);
        let key = InvestigationCache::<MemoryStore>::key_for(&scope);
        cache.store().set(&key, "{not json")?;
        assert!(cache.load_at(&scope, now()).is_none());
        Ok(())
    }

    #[test]
    fn test_quota_failure_is_swallowed() {
        let cache = InvestigationCache::new(MemoryStore::with_quota(16));
        let scope = ctx(&[]);
        cache.save_at(&scope, &payload("a"), now());
        assert!(cache.load_at(&scope, now()).is_none());
    }

    struct FailingStore;

    impl KvStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        fn keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
    }

    #[test]
    fn test_backend_failures_never_surface() {
        let cache = InvestigationCache::new(FailingStore);
        let scope = ctx(&[]);
        cache.save(&scope, &payload("a"));
        assert!(cache.load(&scope).is_none());
        assert_eq!(cache.clear(), 0);
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let cache = InvestigationCache::new(MemoryStore::new());
        for i in 0..15 {
            let scope = QueryContext::new(format!("range-{}", i), "", Default::default());
            cache.save_at(&scope, &payload("a"), now() + Duration::seconds(i));
        }
        let entries = cache.entries();
        assert_eq!(entries.len(), 10);

        let newest = QueryContext::new("range-14", "", Default::default());
        let oldest = QueryContext::new("range-0", "", Default::default());
        let at = now() + Duration::seconds(20);
        assert!(cache.load_at(&newest, at).is_some());
        assert!(cache.load_at(&oldest, at).is_none());
    }

    fn anomaly(category: Category) -> AnomalyRef {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        AnomalyRef::new(TimeWindow::new(t0, t0 + Duration::minutes(5)), category)
    }

    #[test]
    fn test_record_merges_and_clear_removes_all() {
        let cache = InvestigationCache::new(MemoryStore::new());
        let scope = ctx(&[]);
        let first = anomaly(Category::Red);
        let second = anomaly(Category::Green);

        cache.record_at(&scope, &first, vec![finding("a")], now());
        cache.record_at(&scope, &second, vec![finding("b")], now());

        let top = cache.load_at(&scope, now()).unwrap();
        assert_eq!(top.len(), 2);
        let second_id = generate_id("last 1h", "{}", second.window.start, second.window.end, "green");
        assert_eq!(top[&second_id][0].dim, "b");
        assert_eq!(cache.lookup_at(&scope, &first, now()).unwrap()[0].dim, "a");

        assert_eq!(cache.clear(), 1);
        assert!(cache.load_at(&scope, now()).is_none());
    }
}

//! Query plan caching
//!
//! Plans are keyed by a fingerprint of the query text and its variables, so
//! the same operation with the same arguments reuses a single plan.
//!
//! ## Eviction
//!
//! The cache never grows past `max_size`. Inserting a new key into a full
//! cache first evicts the `max(1, max_size / 10)` entries that were accessed
//! least recently. Evicting in batches keeps the scan off the hot path of most
//! inserts.
//!
//! ## Example
//!
//! ```rust
//! use graphql_federation_gateway::plan_cache::{fingerprint, QueryPlan, QueryPlanCache, QueryPlanCacheConfig};
//! use serde_json::json;
//!
//! let cache = QueryPlanCache::new(QueryPlanCacheConfig::default());
//! let key = fingerprint("{ me { id } }", &json!({}));
//! cache.set(key.clone(), QueryPlan::new(key.clone(), "{ me { id } }", vec![]));
//! assert!(cache.get(&key).is_some());
//! ```

use crate::error::{Error, Result};
use async_graphql::parser::parse_query;
use async_graphql::parser::types::OperationType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a (32 bit) of `query` followed by the canonical JSON of `variables`,
/// as 8 lowercase hex digits.
pub fn fingerprint(query: &str, variables: &Value) -> String {
    let canonical = sort_json_value(variables).to_string();
    let hash = query
        .bytes()
        .chain(canonical.bytes())
        .fold(FNV_OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME));
    format!("{:08x}", hash)
}

/// Recursively sort object keys so equal variables serialize identically.
pub(crate) fn sort_json_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| *k);
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_json_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_json_value).collect()),
        _ => value.clone(),
    }
}

/// One subgraph fetch in a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub subgraph_id: String,
}

/// A synthesized execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub fingerprint: String,
    pub query: String,
    pub steps: Vec<PlanStep>,
    pub estimated_cost: u32,
    pub complexity: u32,
    /// Every operation in the document is a query
    #[serde(default)]
    pub read_only: bool,
}

impl QueryPlan {
    /// Build a plan, estimating complexity from selection depth and field count.
    pub fn new(fingerprint: impl Into<String>, query: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        let query = query.into();
        let complexity = estimate_complexity(&query);
        let estimated_cost = complexity.saturating_mul(steps.len().max(1) as u32);
        let read_only = is_read_only(&query);
        Self {
            fingerprint: fingerprint.into(),
            query,
            steps,
            estimated_cost,
            complexity,
            read_only,
        }
    }

    pub fn subgraphs(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.subgraph_id.as_str()).collect()
    }
}

/// Whether every operation in `query` is a query. A document that does not
/// parse is not.
pub fn is_read_only(query: &str) -> bool {
    match parse_query(query) {
        Ok(document) => document
            .operations
            .iter()
            .all(|(_, operation)| operation.node.ty == OperationType::Query),
        Err(_) => false,
    }
}

/// Max selection depth plus the number of field-like tokens.
fn estimate_complexity(query: &str) -> u32 {
    let mut depth: u32 = 0;
    let mut max_depth: u32 = 0;
    let mut fields: u32 = 0;
    let mut in_word = false;
    let mut in_args = 0u32;

    for ch in query.chars() {
        match ch {
            '{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
                in_word = false;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                in_word = false;
            }
            '(' => {
                in_args += 1;
                in_word = false;
            }
            ')' => {
                in_args = in_args.saturating_sub(1);
                in_word = false;
            }
            c if c.is_alphanumeric() || c == '_' => {
                if !in_word && in_args == 0 && depth > 0 {
                    fields += 1;
                }
                in_word = true;
            }
            _ => in_word = false,
        }
    }
    max_depth + fields
}

/// Query plan cache configuration
#[derive(Debug, Clone)]
pub struct QueryPlanCacheConfig {
    pub max_size: usize,
    /// Entries older than this are treated as missing. `None` never expires.
    pub ttl: Option<Duration>,
}

impl Default for QueryPlanCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

impl QueryPlanCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::validation("query plan cache max_size must be greater than 0"));
        }
        if self.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(Error::validation("query plan cache ttl must be greater than 0"));
        }
        Ok(())
    }
}

/// A cached plan and its access bookkeeping
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub plan: Arc<QueryPlan>,
    pub created_at: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl CachedPlan {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.created_at.elapsed() >= ttl)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CachedPlan>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded fingerprint → plan cache
#[derive(Debug)]
pub struct QueryPlanCache {
    config: QueryPlanCacheConfig,
    state: Mutex<CacheState>,
}

impl QueryPlanCache {
    pub fn new(config: QueryPlanCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &QueryPlanCacheConfig {
        &self.config
    }

    /// Look up a plan, bumping its access count on a hit.
    pub fn get(&self, key: &str) -> Option<Arc<QueryPlan>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let expired = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(self.config.ttl) => {
                entry.access_count += 1;
                entry.last_accessed = Instant::now();
                let plan = Arc::clone(&entry.plan);
                state.hits += 1;
                return Some(plan);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
            debug!(key = %key, "Query plan expired");
        }
        state.misses += 1;
        None
    }

    /// Cached entry with its bookkeeping, without counting as an access.
    pub fn peek(&self, key: &str) -> Option<CachedPlan> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Insert or replace a plan. Replacing an existing key never evicts.
    pub fn set(&self, key: impl Into<String>, plan: QueryPlan) -> Arc<QueryPlan> {
        let key = key.into();
        let plan = Arc::new(plan);
        let now = Instant::now();
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.max_size {
            let evicted = Self::evict_least_recent(&mut state, self.batch_size());
            debug!(evicted, "Evicted least recently used query plans");
        }

        state.entries.insert(
            key,
            CachedPlan {
                plan: Arc::clone(&plan),
                created_at: now,
                access_count: 0,
                last_accessed: now,
            },
        );
        plan
    }

    /// Remove keys containing `pattern`, or every key. Returns the count removed.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        match pattern {
            Some(pattern) => state.entries.retain(|key, _| !key.contains(pattern)),
            None => state.entries.clear(),
        }
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, pattern = ?pattern, "Invalidated query plans");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PlanCacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        PlanCacheStats {
            size: state.entries.len(),
            max_size: self.config.max_size,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    fn batch_size(&self) -> usize {
        (self.config.max_size / 10).max(1)
    }

    fn evict_least_recent(state: &mut CacheState, count: usize) -> usize {
        let mut by_age: Vec<(Instant, String)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_accessed, key.clone()))
            .collect();
        by_age.sort_by_key(|(accessed, _)| *accessed);

        let evicted = by_age
            .into_iter()
            .take(count)
            .filter(|(_, key)| state.entries.remove(key).is_some())
            .count();
        state.evictions += evicted as u64;
        evicted
    }
}

/// Query plan cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(key: &str) -> QueryPlan {
        QueryPlan::new(key, "{ me { id } }", vec![PlanStep { subgraph_id: "users".into() }])
    }

    #[test]
    fn test_fingerprint_ignores_variable_order() {
        let a = fingerprint("query($a: Int, $b: Int) { f }", &json!({"a": 1, "b": {"y": 2, "x": 1}}));
        let b = fingerprint("query($a: Int, $b: Int) { f }", &json!({"b": {"x": 1, "y": 2}, "a": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_known_value() {
        // An empty query hashes only the canonical variables
        assert_eq!(fingerprint("", &json!(null)), {
            let hash = "null"
                .bytes()
                .fold(FNV_OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(FNV_PRIME));
            format!("{:08x}", hash)
        });
        assert_ne!(fingerprint("{ a }", &json!({})), fingerprint("{ b }", &json!({})));
    }

    #[test]
    fn test_read_only_detection() {
        assert!(is_read_only("{ me { id } }"));
        assert!(is_read_only("query A { a } query B { b }"));
        assert!(!is_read_only("mutation { incrementCounter }"));
        assert!(!is_read_only("query A { a } mutation B { b }"));
        assert!(!is_read_only("subscription { ticks }"));
        assert!(!is_read_only("{ unbalanced"));
        assert!(plan("k").read_only);
    }

    #[test]
    fn test_hit_bumps_access_count() {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig::default());
        cache.set("k", plan("k"));

        assert!(cache.get("k").is_some());
        assert!(cache.get("k").is_some());
        assert!(cache.get("missing").is_none());

        assert_eq!(cache.peek("k").unwrap().access_count, 2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_batch_eviction_of_least_recent() {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig {
            max_size: 10,
            ttl: None,
        });
        for i in 0..10 {
            cache.set(format!("k{}", i), plan("p"));
            std::thread::sleep(Duration::from_millis(2));
        }
        // Touch k0 so k1 is now the oldest
        assert!(cache.get("k0").is_some());

        cache.set("k10", plan("p"));
        assert_eq!(cache.len(), 10);
        assert!(cache.peek("k0").is_some());
        assert!(cache.peek("k1").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_batch_is_ten_percent() {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig {
            max_size: 50,
            ttl: None,
        });
        for i in 0..50 {
            cache.set(format!("k{}", i), plan("p"));
        }
        cache.set("new", plan("p"));
        assert_eq!(cache.len(), 46);
        assert_eq!(cache.stats().evictions, 5);
    }

    #[test]
    fn test_update_existing_key_does_not_evict() {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig {
            max_size: 2,
            ttl: None,
        });
        cache.set("a", plan("a"));
        cache.set("b", plan("b"));
        cache.set("a", plan("a2"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a").unwrap().fingerprint, "a2");
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig {
            max_size: 10,
            ttl: Some(Duration::from_millis(20)),
        });
        cache.set("k", plan("k"));
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = QueryPlanCache::new(QueryPlanCacheConfig::default());
        cache.set("users:1", plan("a"));
        cache.set("users:2", plan("b"));
        cache.set("products:1", plan("c"));

        assert_eq!(cache.invalidate(Some("users")), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(QueryPlanCacheConfig { max_size: 0, ttl: None }.validate().is_err());
        assert!(QueryPlanCacheConfig {
            max_size: 1,
            ttl: Some(Duration::ZERO)
        }
        .validate()
        .is_err());
        assert!(QueryPlanCacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_complexity_estimate() {
        let flat = QueryPlan::new("f", "{ me { id } }", vec![]);
        let nested = QueryPlan::new("n", "{ me { id reviews(first: 5) { body product { upc } } } }", vec![]);
        assert!(nested.complexity > flat.complexity);
        assert_eq!(flat.complexity, 2 + 2);
    }
}

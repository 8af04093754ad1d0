//! Request batching for subgraph fetches
//!
//! Loads issued for the same subgraph and the same batch function within one
//! batch window are coalesced into a single call of that function. There is
//! one [`DataLoader`] per `(subgraph, batch function type)` pair.
//!
//! Results can also be kept in a small bounded cache keyed by the load key.
//! The cache is off unless `max_cache_entries` is set, and entries expire
//! after `cache_ttl`. Callers decide what is cacheable: the executor only
//! reads and fills it for read-only operations.

use crate::error::{Error, Result};
use crate::plan_cache::sort_json_value;
use async_graphql::dataloader::{DataLoader, Loader};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::any::TypeId;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Fetches many keys from one subgraph in a single call.
///
/// The returned values must line up with `keys`.
#[async_trait]
pub trait BatchFunction: Send + Sync + 'static {
    async fn load(&self, subgraph_id: &str, keys: &[Value]) -> Result<Vec<Value>>;
}

/// Derives the cache key of a load key.
pub type CacheKeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Batch loader configuration
#[derive(Clone)]
pub struct DataLoaderConfig {
    pub max_batch_size: usize,
    /// How long loads accumulate before a batch is dispatched
    pub batch_window: Option<Duration>,
    /// Defaults to the key's JSON with sorted object keys
    pub cache_key_fn: Option<CacheKeyFn>,
    pub enable_batch_logging: bool,
    /// Result cache capacity. `0` disables the cache.
    pub max_cache_entries: usize,
    /// Age after which a cached result is ignored. `None` never expires.
    pub cache_ttl: Option<Duration>,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_window: Some(Duration::from_millis(1)),
            cache_key_fn: None,
            enable_batch_logging: false,
            max_cache_entries: 0,
            cache_ttl: Some(Duration::from_secs(30)),
        }
    }
}

impl DataLoaderConfig {
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn batch_window(mut self, window: Duration) -> Self {
        self.batch_window = Some(window);
        self
    }

    pub fn cache_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.cache_key_fn = Some(Arc::new(f));
        self
    }

    pub fn enable_batch_logging(mut self, enabled: bool) -> Self {
        self.enable_batch_logging = enabled;
        self
    }

    pub fn max_cache_entries(mut self, entries: usize) -> Self {
        self.max_cache_entries = entries;
        self
    }

    pub fn cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::validation("max_batch_size must be greater than 0"));
        }
        if self.cache_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(Error::validation("cache_ttl must be greater than 0"));
        }
        Ok(())
    }

    fn cache_key(&self, key: &Value) -> String {
        match &self.cache_key_fn {
            Some(f) => f(key),
            None => sort_json_value(key).to_string(),
        }
    }
}

impl std::fmt::Debug for DataLoaderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoaderConfig")
            .field("max_batch_size", &self.max_batch_size)
            .field("batch_window", &self.batch_window)
            .field("cache_key_fn", &self.cache_key_fn.is_some())
            .field("enable_batch_logging", &self.enable_batch_logging)
            .field("max_cache_entries", &self.max_cache_entries)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

/// A load key, compared by its cache key only
#[derive(Clone, Debug)]
struct LoadKey {
    cache_key: Arc<str>,
    value: Arc<Value>,
}

impl PartialEq for LoadKey {
    fn eq(&self, other: &Self) -> bool {
        self.cache_key == other.cache_key
    }
}

impl Eq for LoadKey {}

impl Hash for LoadKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cache_key.hash(state);
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    keys: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

struct InstrumentedLoader {
    subgraph_id: String,
    function: Arc<dyn BatchFunction>,
    counters: Arc<Counters>,
    log_batches: bool,
}

impl Loader<LoadKey> for InstrumentedLoader {
    type Value = Value;
    type Error = Error;

    async fn load(&self, keys: &[LoadKey]) -> std::result::Result<HashMap<LoadKey, Value>, Error> {
        let start = Instant::now();
        let inputs: Vec<Value> = keys.iter().map(|k| (*k.value).clone()).collect();
        let values = self.function.load(&self.subgraph_id, &inputs).await?;

        if values.len() != keys.len() {
            return Err(Error::type_conversion(format!(
                "batch function for '{}' returned {} values for {} keys",
                self.subgraph_id,
                values.len(),
                keys.len()
            ))
            .with_context("subgraph", &self.subgraph_id));
        }

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters.keys.fetch_add(keys.len() as u64, Ordering::Relaxed);
        if self.log_batches {
            info!(
                subgraph = %self.subgraph_id,
                size = keys.len(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Dispatched batch"
            );
        }

        Ok(keys.iter().cloned().zip(values).collect())
    }
}

type LoaderKey = (String, TypeId);

type EntryKey = (LoaderKey, Arc<str>);

#[derive(Default)]
struct ResultCache {
    entries: HashMap<EntryKey, (Value, Instant)>,
    order: VecDeque<EntryKey>,
}

/// Per-subgraph request coalescer
pub struct BatchLoader {
    config: DataLoaderConfig,
    loaders: RwLock<HashMap<LoaderKey, Arc<DataLoader<InstrumentedLoader>>>>,
    cache: Mutex<ResultCache>,
    counters: Arc<Counters>,
}

impl BatchLoader {
    pub fn new(config: DataLoaderConfig) -> Self {
        Self {
            config,
            loaders: RwLock::new(HashMap::new()),
            cache: Mutex::new(ResultCache::default()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Load one key, batched with concurrent loads for the same subgraph and function type.
    ///
    /// Answers from the result cache when it holds a fresh value. The first
    /// `function` seen for a `(subgraph, type)` pair serves every later load
    /// of that pair.
    pub async fn load<F: BatchFunction>(&self, subgraph_id: &str, function: Arc<F>, key: Value) -> Result<Value> {
        if let Some(value) = self.cached::<F>(subgraph_id, &key) {
            return Ok(value);
        }
        self.fetch(subgraph_id, function, key).await
    }

    /// Fresh cached result for `key`, counted as a cache hit.
    pub fn cached<F: BatchFunction>(&self, subgraph_id: &str, key: &Value) -> Option<Value> {
        if self.config.max_cache_entries == 0 {
            return None;
        }
        let entry_key: EntryKey = (
            (subgraph_id.to_string(), TypeId::of::<F>()),
            Arc::from(self.config.cache_key(key)),
        );
        let mut cache = self.cache.lock();
        let expired = match cache.entries.get(&entry_key) {
            Some((value, stored)) if !self.is_stale(*stored) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.entries.remove(&entry_key);
            cache.order.retain(|k| k != &entry_key);
        }
        None
    }

    /// Load one key through its batch without reading the result cache.
    ///
    /// The result is still stored when caching is enabled.
    pub async fn fetch<F: BatchFunction>(&self, subgraph_id: &str, function: Arc<F>, key: Value) -> Result<Value> {
        let loader_key: LoaderKey = (subgraph_id.to_string(), TypeId::of::<F>());
        let cache_key: Arc<str> = Arc::from(self.config.cache_key(&key));
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        let loader = self.loader_for(loader_key.clone(), function);
        let value = loader
            .load_one(LoadKey {
                cache_key: Arc::clone(&cache_key),
                value: Arc::new(key),
            })
            .await?
            .ok_or_else(|| {
                Error::entity_resolution(format!("no value loaded from '{}'", subgraph_id))
                    .with_context("subgraph", subgraph_id)
            })?;

        self.remember(loader_key, cache_key, value.clone());
        Ok(value)
    }

    /// Load several keys; they join the same batches.
    pub async fn load_many<F: BatchFunction>(
        &self,
        subgraph_id: &str,
        function: Arc<F>,
        keys: Vec<Value>,
    ) -> Result<Vec<Value>> {
        futures::future::try_join_all(
            keys.into_iter()
                .map(|key| self.load(subgraph_id, Arc::clone(&function), key)),
        )
        .await
    }

    fn loader_for<F: BatchFunction>(&self, key: LoaderKey, function: Arc<F>) -> Arc<DataLoader<InstrumentedLoader>> {
        if let Some(loader) = self.loaders.read().get(&key) {
            return Arc::clone(loader);
        }

        let mut loaders = self.loaders.write();
        Arc::clone(loaders.entry(key).or_insert_with_key(|(subgraph_id, _)| {
            debug!(subgraph = %subgraph_id, "Creating batch loader");
            let instrumented = InstrumentedLoader {
                subgraph_id: subgraph_id.clone(),
                function,
                counters: Arc::clone(&self.counters),
                log_batches: self.config.enable_batch_logging,
            };
            let mut loader = DataLoader::new(instrumented, tokio::spawn)
                .max_batch_size(self.config.max_batch_size);
            if let Some(window) = self.config.batch_window {
                loader = loader.delay(window);
            }
            Arc::new(loader)
        }))
    }

    fn is_stale(&self, stored: Instant) -> bool {
        self.config.cache_ttl.is_some_and(|ttl| stored.elapsed() >= ttl)
    }

    fn remember(&self, loader_key: LoaderKey, cache_key: Arc<str>, value: Value) {
        if self.config.max_cache_entries == 0 {
            return;
        }
        let mut cache = self.cache.lock();
        let entry_key = (loader_key, cache_key);
        if cache.entries.insert(entry_key.clone(), (value, Instant::now())).is_none() {
            cache.order.push_back(entry_key);
        }
        while cache.entries.len() > self.config.max_cache_entries {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Forget every cached result.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        cache.entries.clear();
        cache.order.clear();
    }

    pub fn stats(&self) -> BatchLoaderStats {
        let batches = self.counters.batches.load(Ordering::Relaxed);
        let keys = self.counters.keys.load(Ordering::Relaxed);
        BatchLoaderStats {
            loaders: self.loaders.read().len(),
            batches,
            keys_loaded: keys,
            average_batch_size: if batches == 0 {
                0.0
            } else {
                keys as f64 / batches as f64
            },
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            cache_size: self.cache.lock().entries.len(),
        }
    }
}

impl std::fmt::Debug for BatchLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("config", &self.config)
            .field("loaders", &self.loaders.read().len())
            .finish()
    }
}

/// Batch loader statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLoaderStats {
    pub loaders: usize,
    pub batches: u64,
    pub keys_loaded: u64,
    pub average_batch_size: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFunction {
        calls: AtomicUsize,
        sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl BatchFunction for CountingFunction {
        async fn load(&self, subgraph_id: &str, keys: &[Value]) -> Result<Vec<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().push(keys.len());
            Ok(keys
                .iter()
                .map(|k| json!({ "subgraph": subgraph_id, "key": k }))
                .collect())
        }
    }

    struct ShortFunction;

    #[async_trait]
    impl BatchFunction for ShortFunction {
        async fn load(&self, _subgraph_id: &str, _keys: &[Value]) -> Result<Vec<Value>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_are_batched() {
        let loader = BatchLoader::new(DataLoaderConfig::default().batch_window(Duration::from_millis(5)));
        let function = Arc::new(CountingFunction::default());

        let values = loader
            .load_many("users", Arc::clone(&function), vec![json!(1), json!(2), json!(3)])
            .await
            .unwrap();

        assert_eq!(values.len(), 3);
        assert_eq!(values[2], json!({ "subgraph": "users", "key": 3 }));
        assert_eq!(function.calls.load(Ordering::SeqCst), 1);

        let stats = loader.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.keys_loaded, 3);
        assert_eq!(stats.loaders, 1);
    }

    #[tokio::test]
    async fn test_max_batch_size_splits_batches() {
        let loader = BatchLoader::new(
            DataLoaderConfig::default()
                .max_batch_size(2)
                .batch_window(Duration::from_millis(5)),
        );
        let function = Arc::new(CountingFunction::default());
        let keys: Vec<Value> = (0..5).map(|i| json!(i)).collect();

        loader.load_many("products", Arc::clone(&function), keys).await.unwrap();

        let sizes = function.sizes.lock().clone();
        assert!(sizes.iter().all(|s| *s <= 2), "batch sizes {:?}", sizes);
        assert_eq!(sizes.iter().sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn test_result_cache_disabled_by_default() {
        let loader = BatchLoader::new(DataLoaderConfig::default());
        let function = Arc::new(CountingFunction::default());

        loader.load("users", Arc::clone(&function), json!({"id": 1})).await.unwrap();
        loader.load("users", Arc::clone(&function), json!({"id": 1})).await.unwrap();

        assert_eq!(function.calls.load(Ordering::SeqCst), 2);
        assert_eq!(loader.stats().cache_hits, 0);
        assert_eq!(loader.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn test_cached_results_expire() {
        let loader = BatchLoader::new(
            DataLoaderConfig::default()
                .max_cache_entries(10)
                .cache_ttl(Some(Duration::from_millis(20))),
        );
        let function = Arc::new(CountingFunction::default());

        loader.load("users", Arc::clone(&function), json!(1)).await.unwrap();
        assert!(loader.cached::<CountingFunction>("users", &json!(1)).is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(loader.cached::<CountingFunction>("users", &json!(1)).is_none());
        assert_eq!(loader.stats().cache_size, 0);

        loader.load("users", Arc::clone(&function), json!(1)).await.unwrap();
        assert_eq!(function.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_skips_cache_reads() {
        let loader = BatchLoader::new(DataLoaderConfig::default().max_cache_entries(10));
        let function = Arc::new(CountingFunction::default());

        loader.fetch("users", Arc::clone(&function), json!(1)).await.unwrap();
        loader.fetch("users", Arc::clone(&function), json!(1)).await.unwrap();
        assert_eq!(function.calls.load(Ordering::SeqCst), 2);
        assert_eq!(loader.stats().cache_size, 1);
    }

    #[tokio::test]
    async fn test_result_cache_hit() {
        let loader = BatchLoader::new(DataLoaderConfig::default().max_cache_entries(100));
        let function = Arc::new(CountingFunction::default());

        loader.load("users", Arc::clone(&function), json!({"id": 1, "t": "User"})).await.unwrap();
        // Same key with different field order hits the cache
        loader.load("users", Arc::clone(&function), json!({"t": "User", "id": 1})).await.unwrap();

        assert_eq!(function.calls.load(Ordering::SeqCst), 1);
        let stats = loader.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);

        loader.clear_cache();
        loader.load("users", Arc::clone(&function), json!({"id": 1, "t": "User"})).await.unwrap();
        assert_eq!(function.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_separate_loader_per_subgraph() {
        let loader = BatchLoader::new(DataLoaderConfig::default());
        let function = Arc::new(CountingFunction::default());

        loader.load("users", Arc::clone(&function), json!(1)).await.unwrap();
        let value = loader.load("reviews", Arc::clone(&function), json!(1)).await.unwrap();

        assert_eq!(value["subgraph"], json!("reviews"));
        assert_eq!(loader.stats().loaders, 2);
    }

    #[tokio::test]
    async fn test_custom_cache_key_and_bound() {
        let loader = BatchLoader::new(
            DataLoaderConfig::default()
                .cache_key_fn(|v| v["id"].to_string())
                .max_cache_entries(2),
        );
        let function = Arc::new(CountingFunction::default());

        for id in 0..3 {
            loader.load("users", Arc::clone(&function), json!({"id": id})).await.unwrap();
        }
        assert_eq!(loader.stats().cache_size, 2);

        // Extra fields do not change the custom key
        loader
            .load("users", Arc::clone(&function), json!({"id": 2, "extra": true}))
            .await
            .unwrap();
        assert_eq!(loader.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_mismatched_batch_is_an_error() {
        let loader = BatchLoader::new(DataLoaderConfig::default());
        let err = loader.load("users", Arc::new(ShortFunction), json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TypeConversion);
    }

    #[test]
    fn test_config_validation() {
        assert!(DataLoaderConfig::default().max_batch_size(0).validate().is_err());
        assert!(DataLoaderConfig::default()
            .cache_ttl(Some(Duration::ZERO))
            .validate()
            .is_err());
        assert!(DataLoaderConfig::default().validate().is_ok());
    }
}

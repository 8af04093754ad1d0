//! Federated query execution
//!
//! [`OptimizedExecutor`] ties the performance layer together for one query:
//!
//! 1. Fingerprint the query and its variables
//! 2. Reuse a cached [`QueryPlan`] or synthesize and cache a new one
//! 3. Dispatch every plan step concurrently through the [`ErrorBoundary`]
//!    and the [`BatchLoader`] to a [`SubgraphClient`]. Read-only plans may be
//!    answered from the batch result cache, which bypasses the boundary.
//!    Mutations and subscriptions skip the loader and reach the subgraph on
//!    every call.
//! 4. Merge the results with the partial-failure policy
//! 5. Record an execution sample
//!
//! Execution never fails: any error ends up in the response's `errors`.

use crate::batch_loader::{BatchFunction, BatchLoader, BatchLoaderStats, DataLoaderConfig};
use crate::error::{Error, Result};
use crate::error_boundary::{ErrorBoundary, ErrorBoundaryConfig, SubgraphResult};
use crate::metrics::{CacheOperation, ExecutionMetricSample, MetricsCollector};
use crate::plan_cache::{fingerprint, PlanCacheStats, PlanStep, QueryPlan, QueryPlanCache, QueryPlanCacheConfig};
use crate::registry::{RegistryEvent, SubgraphRegistry};
use crate::shutdown::BackgroundTask;
use crate::types::{GraphQLResponse, ServiceDefinition};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

/// Body sent to a subgraph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

/// Transport to a subgraph
#[async_trait]
pub trait SubgraphClient: Send + Sync + 'static {
    /// Execute `request` against `service` and return its `data`.
    ///
    /// A response carrying GraphQL errors is a failure.
    async fn execute(&self, service: &ServiceDefinition, request: &SubgraphRequest) -> Result<Value>;
}

/// Request timeout of the HTTP client built by the gateway binary
pub const DEFAULT_SUBGRAPH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// `SubgraphClient` posting JSON over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpSubgraphClient {
    client: reqwest::Client,
}

impl HttpSubgraphClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct SubgraphResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[async_trait]
impl SubgraphClient for HttpSubgraphClient {
    #[instrument(skip(self, service, request), fields(subgraph = %service.id))]
    async fn execute(&self, service: &ServiceDefinition, request: &SubgraphRequest) -> Result<Value> {
        let response = self
            .client
            .post(&service.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                Error::field_resolution(format!("request to subgraph '{}' failed", service.id))
                    .with_context("subgraph", &service.id)
                    .with_cause(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::field_resolution(format!(
                "subgraph '{}' returned HTTP {}",
                service.id,
                status.as_u16()
            ))
            .with_context("subgraph", &service.id)
            .with_context("status", status.as_u16()));
        }

        let body: SubgraphResponse = response.json().await.map_err(|e| {
            Error::type_conversion(format!("subgraph '{}' returned an invalid GraphQL response", service.id))
                .with_context("subgraph", &service.id)
                .with_cause(e)
        })?;

        if !body.errors.is_empty() {
            let first = body
                .errors
                .first()
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(Error::field_resolution(format!("subgraph '{}': {}", service.id, first))
                .with_context("subgraph", &service.id)
                .with_context("errors", &body.errors));
        }

        Ok(body.data.unwrap_or(Value::Null))
    }
}

/// Batch function resolving subgraph ids through the registry
struct SubgraphFetch {
    registry: Arc<SubgraphRegistry>,
    client: Arc<dyn SubgraphClient>,
}

#[async_trait]
impl BatchFunction for SubgraphFetch {
    async fn load(&self, subgraph_id: &str, keys: &[Value]) -> Result<Vec<Value>> {
        let service = self.registry.service(subgraph_id).ok_or_else(|| {
            Error::field_resolution(format!("subgraph '{}' is not registered", subgraph_id))
                .with_context("subgraph", subgraph_id)
        })?;

        let requests = keys
            .iter()
            .map(|key| {
                serde_json::from_value::<SubgraphRequest>(key.clone()).map_err(|e| {
                    Error::type_conversion("invalid subgraph request").with_cause(e)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        futures::future::try_join_all(
            requests
                .iter()
                .map(|request| self.client.execute(&service, request)),
        )
        .await
    }
}

impl SubgraphFetch {
    /// One unbatched request.
    async fn load_one(&self, subgraph_id: &str, key: Value) -> Result<Value> {
        self.load(subgraph_id, std::slice::from_ref(&key))
            .await?
            .pop()
            .ok_or_else(|| {
                Error::field_resolution(format!("no response from subgraph '{}'", subgraph_id))
                    .with_context("subgraph", subgraph_id)
            })
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Restrict the plan to these subgraphs instead of every registered one
    pub subgraphs: Option<Vec<String>>,
    pub operation_name: Option<String>,
}

impl ExecutionContext {
    pub fn with_subgraphs<I, S>(mut self, subgraphs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subgraphs = Some(subgraphs.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub plan_cache: QueryPlanCacheConfig,
    pub data_loader: DataLoaderConfig,
    pub error_boundary: ErrorBoundaryConfig,
    pub metrics_max_samples: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            plan_cache: QueryPlanCacheConfig::default(),
            data_loader: DataLoaderConfig::default(),
            error_boundary: ErrorBoundaryConfig::default(),
            metrics_max_samples: 1000,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        self.plan_cache.validate()?;
        self.data_loader.validate()?;
        self.error_boundary.validate()
    }
}

/// Executes federated queries with plan caching, batching and fault isolation
pub struct OptimizedExecutor {
    registry: Arc<SubgraphRegistry>,
    cache: QueryPlanCache,
    loader: BatchLoader,
    boundary: Arc<ErrorBoundary>,
    metrics: Arc<MetricsCollector>,
    fetch: Arc<SubgraphFetch>,
}

impl OptimizedExecutor {
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<SubgraphRegistry>,
        client: Arc<dyn SubgraphClient>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsCollector::new(config.metrics_max_samples)?);
        Ok(Self {
            fetch: Arc::new(SubgraphFetch {
                registry: Arc::clone(&registry),
                client,
            }),
            registry,
            cache: QueryPlanCache::new(config.plan_cache),
            loader: BatchLoader::new(config.data_loader),
            boundary: Arc::new(ErrorBoundary::new(config.error_boundary)),
            metrics,
        })
    }

    /// Execute `query` against the subgraphs in its plan.
    #[instrument(skip_all)]
    pub async fn execute(&self, query: &str, variables: Map<String, Value>, context: &ExecutionContext) -> GraphQLResponse {
        let start = Instant::now();
        let variables = Value::Object(variables);
        let key = plan_key(query, &variables, context);

        let (plan, cache_hit) = match self.cache.get(&key) {
            Some(plan) => {
                self.metrics.record_cache_operation(CacheOperation::Hit, &key);
                debug!(plan = %key, "Query plan cache hit");
                (plan, true)
            }
            None => {
                self.metrics.record_cache_operation(CacheOperation::Miss, &key);
                let plan = self.build_plan(&key, query, context);
                let plan = self.cache.set(key.clone(), plan);
                self.metrics.record_cache_operation(CacheOperation::Set, &key);
                debug!(plan = %key, steps = plan.steps.len(), cost = plan.estimated_cost, "Query plan created");
                (plan, false)
            }
        };

        let response = if plan.steps.is_empty() {
            let err = Error::federation("no subgraphs available to execute the query");
            GraphQLResponse::error(self.boundary.transform_error(&err))
        } else {
            self.dispatch(&plan, query, variables, context).await
        };

        let duration = start.elapsed();
        self.metrics.record_execution(ExecutionMetricSample {
            fingerprint: key,
            duration,
            success: response.is_ok(),
            cache_hit,
            subgraphs: plan.subgraphs().into_iter().map(str::to_string).collect(),
            timestamp: Utc::now(),
        });
        debug!(
            duration_ms = duration.as_millis() as u64,
            errors = response.errors.len(),
            cache_hit,
            "Federated query complete"
        );
        response
    }

    async fn dispatch(
        &self,
        plan: &QueryPlan,
        query: &str,
        variables: Value,
        context: &ExecutionContext,
    ) -> GraphQLResponse {
        let request = serde_json::json!({
            "query": query,
            "variables": variables,
            "operationName": context.operation_name,
        });

        let read_only = plan.read_only;
        let results = futures::future::join_all(plan.steps.iter().map(|step| {
            let request = request.clone();
            async move {
                let subgraph_id = step.subgraph_id.as_str();
                if read_only {
                    if let Some(value) = self.loader.cached::<SubgraphFetch>(subgraph_id, &request) {
                        debug!(subgraph = %subgraph_id, "Subgraph result served from batch cache");
                        return SubgraphResult {
                            subgraph_id: subgraph_id.to_string(),
                            result: Ok(value),
                        };
                    }
                }

                let outcome = self
                    .boundary
                    .guard(subgraph_id, move || async move {
                        if read_only {
                            self.loader.fetch(subgraph_id, Arc::clone(&self.fetch), request).await
                        } else {
                            self.fetch.load_one(subgraph_id, request).await
                        }
                    })
                    .await;
                self.metrics.record_subgraph_request(subgraph_id, outcome.is_ok());
                SubgraphResult {
                    subgraph_id: subgraph_id.to_string(),
                    result: outcome,
                }
            }
        }))
        .await;

        match self.boundary.handle_partial_failure(results) {
            Ok(partial) => partial.into(),
            Err(err) => {
                warn!(error = %err, "Federated query failed");
                GraphQLResponse::error(self.boundary.transform_error(&err))
            }
        }
    }

    fn build_plan(&self, key: &str, query: &str, context: &ExecutionContext) -> QueryPlan {
        let targets: BTreeSet<String> = match &context.subgraphs {
            Some(subgraphs) => subgraphs.iter().cloned().collect(),
            None => self.registry.services().into_iter().map(|s| s.id).collect(),
        };
        let steps = targets
            .into_iter()
            .map(|subgraph_id| PlanStep { subgraph_id })
            .collect();
        QueryPlan::new(key, query, steps)
    }

    /// Drop cached plans whose key contains `pattern`, or all of them.
    pub fn invalidate_plans(&self, pattern: Option<&str>) -> usize {
        let removed = self.cache.invalidate(pattern);
        if removed > 0 {
            self.metrics.record_cache_operation(CacheOperation::Invalidate, pattern.unwrap_or("*"));
        }
        removed
    }

    /// Invalidate every plan whenever the set of registered subgraphs changes.
    pub fn invalidate_on_registry_changes(self: &Arc<Self>) -> BackgroundTask {
        let executor = Arc::clone(self);
        let mut events = self.registry.subscribe();
        BackgroundTask::spawn_until_stopped("plan-invalidation", async move {
            let mut known: BTreeSet<String> = executor.registry.store().ids().into_iter().collect();
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Registered(_)) | Ok(RegistryEvent::Unregistered { .. }) => {}
                    Ok(RegistryEvent::Discovered { .. }) => {
                        let current: BTreeSet<String> = executor.registry.store().ids().into_iter().collect();
                        if current == known {
                            continue;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Registry events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
                known = executor.registry.store().ids().into_iter().collect();
                let removed = executor.invalidate_plans(None);
                info!(removed, "Subgraph set changed, query plans invalidated");
            }
        })
    }

    pub fn plan_cache_stats(&self) -> PlanCacheStats {
        self.cache.stats()
    }

    pub fn batch_stats(&self) -> BatchLoaderStats {
        self.loader.stats()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn boundary(&self) -> &Arc<ErrorBoundary> {
        &self.boundary
    }

    pub fn registry(&self) -> &Arc<SubgraphRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for OptimizedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizedExecutor")
            .field("registry", &self.registry)
            .field("cache", &self.cache.stats())
            .field("loader", &self.loader)
            .finish()
    }
}

/// Cache key for a plan: the fingerprint, suffixed with explicit targets.
fn plan_key(query: &str, variables: &Value, context: &ExecutionContext) -> String {
    let fp = fingerprint(query, variables);
    match &context.subgraphs {
        Some(subgraphs) => {
            let targets: BTreeSet<&str> = subgraphs.iter().map(String::as_str).collect();
            format!("{}@{}", fp, targets.into_iter().collect::<Vec<_>>().join(","))
        }
        None => fp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::registry::RegistryConfig;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockClient {
        responses: HashMap<String, Result<Value>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<SubgraphRequest>>,
        down: AtomicBool,
    }

    impl MockClient {
        fn with(mut self, subgraph: &str, response: Result<Value>) -> Self {
            self.responses.insert(subgraph.to_string(), response);
            self
        }
    }

    #[async_trait]
    impl SubgraphClient for MockClient {
        async fn execute(&self, service: &ServiceDefinition, request: &SubgraphRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(request.clone());
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::field_resolution(format!("{} is down", service.id)));
            }
            self.responses
                .get(&service.id)
                .cloned()
                .unwrap_or_else(|| Ok(json!({})))
        }
    }

    fn registry() -> Arc<SubgraphRegistry> {
        let registry = SubgraphRegistry::new(RegistryConfig::with_static_services(vec![
            ServiceDefinition::new("users", "http://users.local/graphql"),
            ServiceDefinition::new("products", "http://products.local/graphql"),
        ]))
        .unwrap();
        for service in registry.config().static_services.clone() {
            registry.register(service).unwrap();
        }
        Arc::new(registry)
    }

    fn config() -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        config.error_boundary = ErrorBoundaryConfig::new().sanitize_errors(false);
        config
    }

    fn cached_config() -> ExecutorConfig {
        let mut config = config();
        config.data_loader = DataLoaderConfig::default().max_cache_entries(100);
        config
    }

    #[tokio::test]
    async fn test_execute_merges_subgraphs() {
        let client = Arc::new(
            MockClient::default()
                .with("users", Ok(json!({"me": {"id": "1"}})))
                .with("products", Ok(json!({"topProducts": [{"upc": "1"}]}))),
        );
        let executor = OptimizedExecutor::new(config(), registry(), client.clone()).unwrap();

        let response = executor
            .execute("{ me { id } topProducts { upc } }", Map::new(), &ExecutionContext::default())
            .await;

        assert!(response.is_ok(), "{:?}", response.errors);
        assert_eq!(
            response.data,
            Some(json!({"me": {"id": "1"}, "topProducts": [{"upc": "1"}]}))
        );
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.seen.lock()[0].query, "{ me { id } topProducts { upc } }");
    }

    #[tokio::test]
    async fn test_plan_cache_hit_on_repeat() {
        let executor =
            OptimizedExecutor::new(config(), registry(), Arc::new(MockClient::default())).unwrap();
        let mut vars = Map::new();
        vars.insert("id".into(), json!("1"));

        executor.execute("query($id: ID!) { user(id: $id) { id } }", vars.clone(), &ExecutionContext::default()).await;
        executor.execute("query($id: ID!) { user(id: $id) { id } }", vars, &ExecutionContext::default()).await;

        let stats = executor.plan_cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);

        let samples = executor.metrics().execution_samples();
        assert_eq!(samples.len(), 2);
        assert!(!samples[0].cache_hit);
        assert!(samples[1].cache_hit);
        assert_eq!(samples[1].subgraphs, vec!["products".to_string(), "users".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_without_partial_returns_errors() {
        let client = MockClient::default()
            .with("users", Ok(json!({"me": {"id": "1"}})))
            .with("products", Err(Error::field_resolution("products down")));
        let executor = OptimizedExecutor::new(config(), registry(), Arc::new(client)).unwrap();

        let response = executor.execute("{ me { id } }", Map::new(), &ExecutionContext::default()).await;
        assert!(response.data.is_none());
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].code(), Some("FEDERATION_ERROR"));
        assert!(!executor.metrics().execution_samples()[0].success);
    }

    #[tokio::test]
    async fn test_partial_failure_returns_data_and_errors() {
        let mut config = config();
        config.error_boundary = ErrorBoundaryConfig::new()
            .sanitize_errors(false)
            .allow_partial_failure(true)
            .fallback_value("products", json!({"topProducts": []}));
        let client = MockClient::default()
            .with("users", Ok(json!({"me": {"id": "1"}})))
            .with("products", Err(Error::field_resolution("products down")));
        let executor = OptimizedExecutor::new(config, registry(), Arc::new(client)).unwrap();

        let response = executor.execute("{ me { id } }", Map::new(), &ExecutionContext::default()).await;
        assert_eq!(response.data, Some(json!({"me": {"id": "1"}, "topProducts": []})));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].extensions["subgraph"], json!("products"));
    }

    #[tokio::test]
    async fn test_context_restricts_targets() {
        let client = Arc::new(MockClient::default().with("users", Ok(json!({"me": null}))));
        let executor = OptimizedExecutor::new(config(), registry(), client.clone()).unwrap();

        let context = ExecutionContext::default().with_subgraphs(["users"]).with_operation_name("Me");
        let response = executor.execute("query Me { me { id } }", Map::new(), &context).await;

        assert!(response.is_ok());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.seen.lock()[0].operation_name.as_deref(), Some("Me"));
    }

    #[tokio::test]
    async fn test_unknown_target_is_reported() {
        let executor =
            OptimizedExecutor::new(config(), registry(), Arc::new(MockClient::default())).unwrap();
        let context = ExecutionContext::default().with_subgraphs(["inventory"]);
        let response = executor.execute("{ stock }", Map::new(), &context).await;
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let mut config = config();
        config.error_boundary = ErrorBoundaryConfig::new()
            .sanitize_errors(false)
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            });
        let client = Arc::new(MockClient::default().with("users", Err(Error::field_resolution("down"))));
        let executor = OptimizedExecutor::new(config, registry(), client.clone()).unwrap();
        let context = ExecutionContext::default().with_subgraphs(["users"]);

        executor.execute("{ me { id } }", Map::new(), &context).await;
        executor.execute("{ me { id } }", Map::new(), &context).await;

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_operations_reach_the_subgraph() {
        let client = Arc::new(MockClient::default());
        let executor = OptimizedExecutor::new(ExecutorConfig::default(), registry(), client.clone()).unwrap();
        let context = ExecutionContext::default().with_subgraphs(["users"]);

        for _ in 0..3 {
            let response = executor.execute("mutation { incrementCounter }", Map::new(), &context).await;
            assert!(response.is_ok(), "{:?}", response.errors);
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);

        executor.execute("{ counter }", Map::new(), &context).await;
        executor.execute("{ counter }", Map::new(), &context).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_result_cache_serves_queries_only() {
        let client = Arc::new(MockClient::default());
        let executor = OptimizedExecutor::new(cached_config(), registry(), client.clone()).unwrap();
        let context = ExecutionContext::default().with_subgraphs(["users"]);

        executor.execute("{ counter }", Map::new(), &context).await;
        executor.execute("{ counter }", Map::new(), &context).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.batch_stats().cache_hits, 1);

        for _ in 0..3 {
            executor.execute("mutation { incrementCounter }", Map::new(), &context).await;
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert_eq!(executor.batch_stats().cache_size, 1);
    }

    #[tokio::test]
    async fn test_cached_results_do_not_drive_the_breaker() {
        let mut config = cached_config();
        config.error_boundary = ErrorBoundaryConfig::new()
            .sanitize_errors(false)
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(20),
                half_open_max_calls: 2,
            });
        let client = Arc::new(MockClient::default());
        let executor = OptimizedExecutor::new(config, registry(), client.clone()).unwrap();
        let context = ExecutionContext::default().with_subgraphs(["users"]);
        let state = || executor.boundary().breakers().get("users").map(|b| b.state());

        executor.execute("{ cached }", Map::new(), &context).await;
        client.down.store(true, Ordering::SeqCst);
        executor.execute("{ first }", Map::new(), &context).await;
        assert_eq!(state(), Some(CircuitState::Open));
        let samples = executor.boundary().pending_samples().len();

        // Cached answers while open neither probe nor count as calls
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(executor.execute("{ cached }", Map::new(), &context).await.is_ok());
        assert_eq!(state(), Some(CircuitState::Open));
        assert_eq!(executor.boundary().pending_samples().len(), samples);

        // One real success in half-open, then cache hits must not close it
        client.down.store(false, Ordering::SeqCst);
        executor.execute("{ second }", Map::new(), &context).await;
        assert_eq!(state(), Some(CircuitState::HalfOpen));
        executor.execute("{ cached }", Map::new(), &context).await;
        executor.execute("{ cached }", Map::new(), &context).await;
        assert_eq!(state(), Some(CircuitState::HalfOpen));

        executor.execute("{ third }", Map::new(), &context).await;
        assert_eq!(state(), Some(CircuitState::Closed));
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_no_subgraphs_is_an_error_response() {
        let executor =
            OptimizedExecutor::new(config(), registry(), Arc::new(MockClient::default())).unwrap();
        let context = ExecutionContext::default().with_subgraphs(Vec::<String>::new());
        let response = executor.execute("{ a }", Map::new(), &context).await;
        assert_eq!(response.errors[0].code(), Some("FEDERATION_ERROR"));
    }

    #[tokio::test]
    async fn test_invalidate_on_registry_change() {
        let registry = registry();
        let executor = Arc::new(
            OptimizedExecutor::new(config(), Arc::clone(&registry), Arc::new(MockClient::default())).unwrap(),
        );
        let watcher = executor.invalidate_on_registry_changes();

        executor.execute("{ me { id } }", Map::new(), &ExecutionContext::default()).await;
        assert_eq!(executor.plan_cache_stats().size, 1);

        registry
            .register(ServiceDefinition::new("reviews", "http://reviews.local/graphql"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.plan_cache_stats().size, 0);
        watcher.stop().await;
    }

    #[test]
    fn test_plan_key_includes_sorted_targets() {
        let ctx = ExecutionContext::default().with_subgraphs(["b", "a"]);
        let key = plan_key("{ a }", &json!({}), &ctx);
        assert!(key.ends_with("@a,b"));
        assert_eq!(plan_key("{ a }", &json!({}), &ExecutionContext::default()).len(), 8);
    }
}

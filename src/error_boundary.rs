//! Per-subgraph fault isolation.
//!
//! Every subgraph call made through an [`ErrorBoundary`] is bounded by a
//! timeout, routed through that subgraph's [`CircuitBreaker`](crate::CircuitBreaker)
//! and recorded as a call sample. Results from several subgraphs are then
//! combined by [`ErrorBoundary::handle_partial_failure`], which decides whether
//! a request can still be answered with the data that did arrive.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::{is_production, Error, ErrorKind, GraphQLError, Result};
use crate::shutdown::BackgroundTask;
use crate::types::GraphQLResponse;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Code used for per-subgraph errors that carry none of their own
pub const SUBGRAPH_ERROR_CODE: &str = "SUBGRAPH_ERROR";

/// Call samples held before the oldest are dropped
pub const MAX_BUFFERED_SAMPLES: usize = 1000;

/// How often buffered samples are folded into per-subgraph stats
pub const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Rewrites a client error after the built-in transformation.
pub type ErrorTransformer = Arc<dyn Fn(GraphQLError, &Error) -> GraphQLError + Send + Sync>;

/// When a request may be answered without every subgraph
#[derive(Debug, Clone, Default)]
pub struct PartialFailureConfig {
    pub allow_partial_failure: bool,
    /// Subgraphs whose failure always fails the request
    pub critical_subgraphs: HashSet<String>,
    /// Data substituted for a failed subgraph, keyed by subgraph id
    pub fallback_values: HashMap<String, Value>,
}

#[derive(Clone)]
pub struct ErrorTransformationConfig {
    pub sanitize_errors: bool,
    pub include_stack_trace: bool,
    pub custom_transformer: Option<ErrorTransformer>,
}

impl Default for ErrorTransformationConfig {
    fn default() -> Self {
        Self {
            sanitize_errors: is_production(),
            include_stack_trace: false,
            custom_transformer: None,
        }
    }
}

impl std::fmt::Debug for ErrorTransformationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTransformationConfig")
            .field("sanitize_errors", &self.sanitize_errors)
            .field("include_stack_trace", &self.include_stack_trace)
            .field("custom_transformer", &self.custom_transformer.is_some())
            .finish()
    }
}

/// Error boundary configuration
#[derive(Debug, Clone)]
pub struct ErrorBoundaryConfig {
    /// Per-subgraph overrides of `default_timeout`
    pub subgraph_timeouts: HashMap<String, Duration>,
    pub default_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    pub partial_failure: PartialFailureConfig,
    pub error_transformation: ErrorTransformationConfig,
}

impl Default for ErrorBoundaryConfig {
    fn default() -> Self {
        Self {
            subgraph_timeouts: HashMap::new(),
            default_timeout: Duration::from_secs(10),
            circuit_breaker: CircuitBreakerConfig::default(),
            partial_failure: PartialFailureConfig::default(),
            error_transformation: ErrorTransformationConfig::default(),
        }
    }
}

impl ErrorBoundaryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn subgraph_timeout(mut self, subgraph_id: impl Into<String>, timeout: Duration) -> Self {
        self.subgraph_timeouts.insert(subgraph_id.into(), timeout);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn allow_partial_failure(mut self, allow: bool) -> Self {
        self.partial_failure.allow_partial_failure = allow;
        self
    }

    pub fn critical_subgraph(mut self, subgraph_id: impl Into<String>) -> Self {
        self.partial_failure.critical_subgraphs.insert(subgraph_id.into());
        self
    }

    pub fn fallback_value(mut self, subgraph_id: impl Into<String>, value: Value) -> Self {
        self.partial_failure.fallback_values.insert(subgraph_id.into(), value);
        self
    }

    pub fn sanitize_errors(mut self, sanitize: bool) -> Self {
        self.error_transformation.sanitize_errors = sanitize;
        self
    }

    pub fn include_stack_trace(mut self, include: bool) -> Self {
        self.error_transformation.include_stack_trace = include;
        self
    }

    pub fn custom_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(GraphQLError, &Error) -> GraphQLError + Send + Sync + 'static,
    {
        self.error_transformation.custom_transformer = Some(Arc::new(transformer));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(Error::validation("default_timeout must be greater than 0"));
        }
        if let Some((id, _)) = self.subgraph_timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::validation(format!("timeout for subgraph '{}' must be greater than 0", id)));
        }
        self.circuit_breaker.validate()
    }
}

/// Outcome of one subgraph call, input to [`ErrorBoundary::handle_partial_failure`]
#[derive(Debug, Clone)]
pub struct SubgraphResult {
    pub subgraph_id: String,
    pub result: Result<Value>,
}

impl SubgraphResult {
    pub fn ok(subgraph_id: impl Into<String>, data: Value) -> Self {
        Self {
            subgraph_id: subgraph_id.into(),
            result: Ok(data),
        }
    }

    pub fn failed(subgraph_id: impl Into<String>, error: Error) -> Self {
        Self {
            subgraph_id: subgraph_id.into(),
            result: Err(error),
        }
    }
}

/// Merged data plus one client-safe error per failed subgraph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialResult {
    pub data: Value,
    pub errors: Vec<GraphQLError>,
}

impl From<PartialResult> for GraphQLResponse {
    fn from(result: PartialResult) -> Self {
        GraphQLResponse {
            data: Some(result.data),
            errors: result.errors,
        }
    }
}

/// One guarded call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSample {
    pub subgraph_id: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub timestamp: DateTime<Utc>,
}

/// Running totals per subgraph, updated on every flush
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphCallStats {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub total_duration_ms: u64,
}

impl SubgraphCallStats {
    pub fn average_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.calls as f64
        }
    }
}

#[derive(Debug, Default)]
struct CallMetrics {
    buffer: Mutex<VecDeque<CallSample>>,
    totals: Mutex<HashMap<String, SubgraphCallStats>>,
}

impl CallMetrics {
    fn push(&self, sample: CallSample) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= MAX_BUFFERED_SAMPLES {
            let excess = (MAX_BUFFERED_SAMPLES / 5).max(1);
            buffer.drain(..excess);
        }
        buffer.push_back(sample);
    }

    fn flush(&self) -> usize {
        let samples: Vec<CallSample> = self.buffer.lock().drain(..).collect();
        if samples.is_empty() {
            return 0;
        }
        let mut totals = self.totals.lock();
        for sample in &samples {
            let stats = totals.entry(sample.subgraph_id.clone()).or_default();
            stats.calls += 1;
            stats.total_duration_ms += sample.duration_ms;
            if !sample.success {
                stats.failures += 1;
            }
            match sample.error_code {
                Some(code) if code == ErrorKind::Timeout.code() => stats.timeouts += 1,
                Some(code) if code == ErrorKind::CircuitBreaker.code() => stats.rejected += 1,
                _ => {}
            }
        }
        debug!(samples = samples.len(), "Flushed subgraph call metrics");
        samples.len()
    }
}

/// Timeout, circuit breaker and partial-failure policy for subgraph calls
pub struct ErrorBoundary {
    config: ErrorBoundaryConfig,
    breakers: CircuitBreakerRegistry,
    metrics: Arc<CallMetrics>,
}

impl ErrorBoundary {
    pub fn new(config: ErrorBoundaryConfig) -> Self {
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        Self {
            config,
            breakers,
            metrics: Arc::new(CallMetrics::default()),
        }
    }

    pub fn config(&self) -> &ErrorBoundaryConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn timeout_for(&self, subgraph_id: &str) -> Duration {
        self.config
            .subgraph_timeouts
            .get(subgraph_id)
            .copied()
            .unwrap_or(self.config.default_timeout)
    }

    /// Run `call` under the subgraph's timeout and circuit breaker.
    ///
    /// A timeout counts as a breaker failure. The error is always returned;
    /// see [`execute`](Self::execute) for the partial-failure aware variant.
    pub async fn guard<F, Fut, T>(&self, subgraph_id: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.timeout_for(subgraph_id);
        let breaker = self.breakers.get_or_create(subgraph_id);
        let start = Instant::now();

        let outcome = breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!(
                        "subgraph '{}' did not respond within {}ms",
                        subgraph_id,
                        timeout.as_millis()
                    ))
                    .with_context("subgraph", subgraph_id)
                    .with_context("timeoutMs", timeout.as_millis() as u64)),
                }
            })
            .await;

        self.metrics.push(CallSample {
            subgraph_id: subgraph_id.to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: outcome.is_ok(),
            error_code: outcome.as_ref().err().map(Error::code),
            timestamp: Utc::now(),
        });

        outcome
    }

    /// Guarded call that absorbs the failure when partial failure is allowed.
    ///
    /// Returns `Ok(None)` for an absorbed failure. Failures of critical
    /// subgraphs are never absorbed.
    pub async fn execute<F, Fut, T>(&self, subgraph_id: &str, call: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.guard(subgraph_id, call).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.absorbs(subgraph_id) => {
                warn!(subgraph = %subgraph_id, error = %err, "Subgraph call failed, continuing with partial data");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Wrap a resolver so every invocation runs through [`execute`](Self::execute).
    pub fn wrap_resolver<R>(self: &Arc<Self>, subgraph_id: impl Into<String>, resolver: R) -> GuardedResolver<R> {
        GuardedResolver {
            boundary: Arc::clone(self),
            subgraph_id: subgraph_id.into(),
            resolver,
        }
    }

    fn absorbs(&self, subgraph_id: &str) -> bool {
        let policy = &self.config.partial_failure;
        policy.allow_partial_failure && !policy.critical_subgraphs.contains(subgraph_id)
    }

    /// Combine per-subgraph results.
    ///
    /// Successful payloads are shallow merged in order. When some subgraphs
    /// failed the request still succeeds if partial failure is allowed and no
    /// critical subgraph is among them; fallback values are then overlaid for
    /// the failed subgraphs.
    pub fn handle_partial_failure(&self, results: Vec<SubgraphResult>) -> Result<PartialResult> {
        let policy = &self.config.partial_failure;
        let mut data = Map::new();
        let mut failed: Vec<(String, Error)> = Vec::new();

        for SubgraphResult { subgraph_id, result } in results {
            match result {
                Ok(payload) => merge_payload(&mut data, &subgraph_id, payload),
                Err(err) => failed.push((subgraph_id, err)),
            }
        }

        if failed.is_empty() {
            return Ok(PartialResult {
                data: Value::Object(data),
                errors: Vec::new(),
            });
        }

        let failed_ids: Vec<&str> = failed.iter().map(|(id, _)| id.as_str()).collect();
        let critical: Vec<&str> = failed_ids
            .iter()
            .copied()
            .filter(|id| policy.critical_subgraphs.contains(*id))
            .collect();

        if !critical.is_empty() {
            return Err(Error::federation(format!(
                "critical subgraphs failed: {}",
                critical.join(", ")
            ))
            .with_context("failedSubgraphs", &failed_ids)
            .with_context("criticalSubgraphs", &critical));
        }
        if !policy.allow_partial_failure {
            return Err(Error::federation(format!("subgraphs failed: {}", failed_ids.join(", ")))
                .with_context("failedSubgraphs", &failed_ids));
        }

        let errors = failed
            .iter()
            .map(|(id, err)| {
                if let Some(fallback) = policy.fallback_values.get(id) {
                    merge_payload(&mut data, id, fallback.clone());
                }
                self.transform_with_default(err, SUBGRAPH_ERROR_CODE)
                    .with_extension("subgraph", Value::String(id.clone()))
            })
            .collect();

        debug!(failed = ?failed_ids, "Returning partial result");
        Ok(PartialResult {
            data: Value::Object(data),
            errors,
        })
    }

    /// Convert an error into the client-facing shape.
    ///
    /// Extensions always carry `code` and `timestamp`, even if a custom
    /// transformer removed them.
    pub fn transform_error(&self, err: &Error) -> GraphQLError {
        self.transform_with_default(err, err.code())
    }

    fn transform_with_default(&self, err: &Error, default_code: &str) -> GraphQLError {
        let settings = &self.config.error_transformation;
        let mut error = err.to_graphql_error_with(settings.sanitize_errors);
        if settings.include_stack_trace {
            error = error.with_extension("stacktrace", serde_json::json!(err.stack()));
        }
        if let Some(transformer) = &settings.custom_transformer {
            error = transformer(error, err);
        }
        error
            .extensions
            .entry("code".to_string())
            .or_insert_with(|| Value::String(default_code.to_string()));
        error
            .extensions
            .entry("timestamp".to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        error
    }

    /// Fold buffered samples into the per-subgraph totals now.
    pub fn flush_metrics(&self) -> usize {
        self.metrics.flush()
    }

    /// Flush samples once per second until the task is stopped.
    pub fn spawn_metrics_flush(&self) -> BackgroundTask {
        let metrics = Arc::clone(&self.metrics);
        BackgroundTask::spawn("error-boundary-metrics", METRICS_FLUSH_INTERVAL, move || {
            let metrics = Arc::clone(&metrics);
            async move {
                metrics.flush();
            }
        })
    }

    /// Samples recorded since the last flush.
    pub fn pending_samples(&self) -> Vec<CallSample> {
        self.metrics.buffer.lock().iter().cloned().collect()
    }

    /// Totals per subgraph as of the last flush.
    pub fn call_stats(&self) -> HashMap<String, SubgraphCallStats> {
        self.metrics.totals.lock().clone()
    }
}

impl std::fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("config", &self.config)
            .field("breakers", &self.breakers)
            .finish()
    }
}

/// A resolver bound to a subgraph's error boundary
pub struct GuardedResolver<R> {
    boundary: Arc<ErrorBoundary>,
    subgraph_id: String,
    resolver: R,
}

impl<R> GuardedResolver<R> {
    pub fn subgraph_id(&self) -> &str {
        &self.subgraph_id
    }

    pub async fn call<A, T, Fut>(&self, args: A) -> Result<Option<T>>
    where
        R: Fn(A) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.boundary
            .execute(&self.subgraph_id, || (self.resolver)(args))
            .await
    }
}

/// Objects are merged key by key; anything else lands under the subgraph id.
fn merge_payload(target: &mut Map<String, Value>, subgraph_id: &str, payload: Value) {
    match payload {
        Value::Object(fields) => target.extend(fields),
        Value::Null => {}
        other => {
            target.insert(subgraph_id.to_string(), other);
        }
    }
}

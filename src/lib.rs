//! # graphql-federation-gateway
//!
//! Runtime core of a GraphQL federation gateway: it discovers independently
//! deployed subgraphs, composes their schemas into one supergraph and
//! protects and accelerates query execution against them.
//!
//! ## Main Components
//!
//! - [`SubgraphRegistry`]: static or polling service discovery, registration
//!   and health monitoring over a [`ServiceStore`].
//! - [`CircuitBreaker`] and [`ErrorBoundary`]: per-subgraph fault isolation,
//!   timeouts and partial-failure aggregation.
//! - [`QueryPlanCache`], [`BatchLoader`] and [`MetricsCollector`]: the
//!   execution performance layer.
//! - [`OptimizedExecutor`]: runs one federated query through all of the above.
//! - [`CompositionEngine`]: validates a federation config and merges subgraph
//!   SDLs into a [`FederatedSchema`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use graphql_federation_gateway::{
//!     ExecutionContext, ExecutorConfig, HttpSubgraphClient, OptimizedExecutor, RegistryConfig,
//!     ServiceDefinition, SubgraphRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(SubgraphRegistry::new(RegistryConfig::with_static_services(vec![
//!         ServiceDefinition::new("users", "http://localhost:4001/graphql"),
//!         ServiceDefinition::new("reviews", "http://localhost:4002/graphql"),
//!     ]))?);
//!     registry.discover().await?;
//!
//!     let executor = OptimizedExecutor::new(
//!         ExecutorConfig::default(),
//!         registry,
//!         Arc::new(HttpSubgraphClient::default()),
//!     )?;
//!     let response = executor
//!         .execute("{ me { id } }", Default::default(), &ExecutionContext::default())
//!         .await;
//!     println!("{}", serde_json::to_string(&response)?);
//!     Ok(())
//! }
//! ```

pub mod batch_loader;
pub mod circuit_breaker;
pub mod composition;
pub mod config;
pub mod error;
pub mod error_boundary;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod plan_cache;
pub mod registry;
pub mod shutdown;
pub mod telemetry;
pub mod types;

pub use batch_loader::{BatchFunction, BatchLoader, BatchLoaderStats, DataLoaderConfig};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState,
};
pub use composition::{
    CompositionEngine, FederatedSchema, FederationCompositionConfig, FederationEntity, PerformanceConfig,
    ReferenceResolver, SchemaMetadata, SdlFetcher,
};
pub use config::GatewayConfig;
pub use error::{Error, ErrorKind, GraphQLError, Result, Severity};
pub use error_boundary::{
    ErrorBoundary, ErrorBoundaryConfig, ErrorTransformationConfig, PartialFailureConfig, PartialResult,
    SubgraphResult,
};
pub use executor::{
    ExecutionContext, ExecutorConfig, HttpSubgraphClient, OptimizedExecutor, SubgraphClient, SubgraphRequest,
};
pub use health::{ComponentHealth, HealthProbe, HealthReport, HealthResponse, HealthStatus};
pub use metrics::{CacheOperation, MetricsCollector, MetricsSummary};
pub use plan_cache::{fingerprint, CachedPlan, PlanCacheStats, QueryPlan, QueryPlanCache, QueryPlanCacheConfig};
pub use registry::{DiscoveryMode, RegistryConfig, RegistryEvent, RetryPolicy, ServiceStore, SubgraphRegistry};
pub use shutdown::{signal_shutdown, BackgroundTask};
pub use telemetry::{init_logging, LogConfig, LogFormat};
pub use types::{GraphQLRequest, GraphQLResponse, ServiceDefinition};

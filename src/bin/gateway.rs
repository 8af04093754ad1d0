//! Federation gateway server
//!
//! Configured entirely from the environment (see `GatewayConfig`):
//!
//! ```text
//! STATIC_SERVICES=users=http://localhost:4001/graphql,reviews=http://localhost:4002/graphql \
//!     SERVER_PORT=4000 cargo run --bin federation-gateway
//! ```
//!
//! Routes: `POST /graphql`, `GET /health`, `GET /ready`, `GET /metrics`.

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use graphql_federation_gateway::executor::DEFAULT_SUBGRAPH_HTTP_TIMEOUT;
use graphql_federation_gateway::health::health_router;
use graphql_federation_gateway::{
    init_logging, signal_shutdown, DiscoveryMode, ExecutionContext, GatewayConfig, GraphQLRequest,
    HttpSubgraphClient, OptimizedExecutor, SubgraphRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    executor: Arc<OptimizedExecutor>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env()?;
    init_logging(&config.log)?;
    if let Err(err) = config.validate() {
        error!(error = %err, "Invalid gateway configuration");
        return Err(err.into());
    }

    let http = reqwest::Client::builder()
        .timeout(DEFAULT_SUBGRAPH_HTTP_TIMEOUT)
        .build()?;

    let registry = Arc::new(SubgraphRegistry::with_client(config.registry.clone(), http.clone())?);
    let services = registry.discover().await?;
    if services.is_empty() {
        warn!("No subgraphs discovered yet");
    }

    let executor = Arc::new(OptimizedExecutor::new(
        config.executor.clone(),
        Arc::clone(&registry),
        Arc::new(HttpSubgraphClient::new(http)),
    )?);

    let invalidation = executor.invalidate_on_registry_changes();
    let metrics_flush = executor.boundary().spawn_metrics_flush();
    let health_monitor = registry.with_health_monitoring();
    let auto_discovery =
        (config.registry.discovery_mode == DiscoveryMode::Dynamic).then(|| registry.with_auto_discovery());

    let app = Router::new()
        .route("/graphql", post(graphql_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState {
            executor: Arc::clone(&executor),
        })
        .merge(health_router(Arc::clone(&registry)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        %addr,
        subgraphs = services.len(),
        mode = ?config.registry.discovery_mode,
        environment = %config.environment,
        "Federation gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(signal_shutdown())
        .await?;

    info!("Shutting down background tasks");
    health_monitor.stop().await;
    metrics_flush.stop().await;
    if let Some(task) = auto_discovery {
        task.stop().await;
    }
    invalidation.stop().await;
    info!("Gateway stopped");
    Ok(())
}

async fn graphql_handler(State(state): State<AppState>, Json(request): Json<GraphQLRequest>) -> impl IntoResponse {
    let mut context = ExecutionContext::default();
    if let Some(name) = request.operation_name {
        context = context.with_operation_name(name);
    }
    let response = state
        .executor
        .execute(&request.query, request.variables, &context)
        .await;
    Json(response)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.executor.metrics().render(),
    )
}

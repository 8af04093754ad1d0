#![allow(dead_code)]

use axum::{
    extract::Json,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A discovery endpoint answering `GET /services` with `services`.
pub async fn spawn_discovery(services: Value) -> String {
    let body = json!({ "services": services });
    let router = Router::new().route(
        "/services",
        get(move || {
            let body = body.clone();
            async move { Json(body) }
        }),
    );
    format!("http://{}/services", serve(router).await)
}

/// A discovery endpoint that always fails.
pub async fn spawn_failing_discovery() -> String {
    let router = Router::new().route(
        "/services",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    format!("http://{}/services", serve(router).await)
}

/// A subgraph whose `/graphql/health` answers with `status` after `delay`.
pub async fn spawn_health(delay: Duration, status: StatusCode) -> String {
    let router = Router::new().route(
        "/graphql/health",
        get(move || async move {
            tokio::time::sleep(delay).await;
            (status, "ok")
        }),
    );
    format!("http://{}/graphql", serve(router).await)
}

/// A federated subgraph: answers `_service { sdl }` with `sdl` and every
/// other operation with `data`.
pub async fn spawn_subgraph(sdl: &'static str, data: Value) -> String {
    let router = Router::new()
        .route(
            "/graphql",
            post(move |Json(body): Json<Value>| {
                let data = data.clone();
                async move {
                    let query = body["query"].as_str().unwrap_or_default();
                    if query.contains("_service") {
                        Json(json!({ "data": { "_service": { "sdl": sdl } } })).into_response()
                    } else {
                        Json(json!({ "data": data })).into_response()
                    }
                }
            }),
        )
        .route("/graphql/health", get(|| async { "ok" }));
    format!("http://{}/graphql", serve(router).await)
}

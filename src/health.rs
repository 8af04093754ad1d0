//! Subgraph health probing and gateway health endpoints.
//!
//! A probe is an HTTP `GET {service_url}/health`. The outcome is classified by
//! status code and latency:
//!
//! | Outcome                         | Status      |
//! |---------------------------------|-------------|
//! | 2xx in under 100ms              | healthy     |
//! | 2xx in under 500ms              | degraded    |
//! | 2xx in 500ms or more            | unhealthy   |
//! | 5xx                             | unhealthy   |
//! | any other status                | degraded    |
//! | network error or timeout        | unhealthy   |
//!
//! The gateway itself exposes `/health` and `/ready`, built from the latest
//! probe results held by the [`SubgraphRegistry`].

use crate::registry::SubgraphRegistry;
use crate::types::ServiceDefinition;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency below which a successful probe counts as healthy
pub const HEALTHY_LATENCY: Duration = Duration::from_millis(100);
/// Latency below which a successful probe counts as degraded
pub const DEGRADED_LATENCY: Duration = Duration::from_millis(500);

/// Health status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Measurements taken by a single probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u32>,
}

/// Latest probe result for one subgraph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service_id: String,
    pub last_check: DateTime<Utc>,
    pub metrics: HealthMetrics,
}

/// Classify a probe that produced an HTTP response.
pub fn classify(status_code: u16, latency: Duration) -> HealthStatus {
    if (500..600).contains(&status_code) {
        HealthStatus::Unhealthy
    } else if !(200..300).contains(&status_code) {
        HealthStatus::Degraded
    } else if latency < HEALTHY_LATENCY {
        HealthStatus::Healthy
    } else if latency < DEGRADED_LATENCY {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

/// Issues `/health` probes against subgraphs.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a service. Never fails: transport errors and timeouts become an
    /// unhealthy report with `error_count = 1`.
    #[tracing::instrument(skip(self, service), fields(service = %service.id))]
    pub async fn check(&self, service: &ServiceDefinition) -> HealthReport {
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.timeout,
            self.client.get(service.health_url()).send(),
        )
        .await;
        let elapsed = start.elapsed();

        let (status, metrics) = match outcome {
            Ok(Ok(response)) => {
                let code = response.status().as_u16();
                (
                    classify(code, elapsed),
                    HealthMetrics {
                        response_time_ms: elapsed.as_millis() as u64,
                        status_code: Some(code),
                        error_count: None,
                    },
                )
            }
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "Health probe failed");
                (HealthStatus::Unhealthy, failed_metrics(elapsed))
            }
            Err(_) => {
                tracing::debug!(timeout_ms = self.timeout.as_millis() as u64, "Health probe timed out");
                (HealthStatus::Unhealthy, failed_metrics(elapsed))
            }
        };

        HealthReport {
            status,
            service_id: service.id.clone(),
            last_check: Utc::now(),
            metrics,
        }
    }
}

fn failed_metrics(elapsed: Duration) -> HealthMetrics {
    HealthMetrics {
        response_time_ms: elapsed.as_millis() as u64,
        status_code: None,
        error_count: Some(1),
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall health status
    pub status: HealthStatus,
    /// Optional message with details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Individual component checks
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub checks: Vec<ComponentHealth>,
}

/// Individual component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component health status
    pub status: HealthStatus,
    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResponse {
    /// Create a healthy response
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            checks: Vec::new(),
        }
    }

    /// Create a healthy response with a message
    pub fn healthy_with_message(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: Some(message.into()),
            checks: Vec::new(),
        }
    }

    /// Create a degraded response
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            checks: Vec::new(),
        }
    }

    /// Add a component check
    pub fn with_check(mut self, check: ComponentHealth) -> Self {
        // Update overall status based on component
        match (&self.status, check.status) {
            (HealthStatus::Healthy, HealthStatus::Unhealthy) => {
                self.status = HealthStatus::Unhealthy;
            }
            (HealthStatus::Healthy, HealthStatus::Degraded) => {
                self.status = HealthStatus::Degraded;
            }
            (HealthStatus::Degraded, HealthStatus::Unhealthy) => {
                self.status = HealthStatus::Unhealthy;
            }
            _ => {}
        }
        self.checks.push(check);
        self
    }

    /// Aggregate subgraph reports into one response, one check per subgraph.
    pub fn from_reports<'a>(reports: impl IntoIterator<Item = &'a HealthReport>) -> Self {
        reports
            .into_iter()
            .fold(HealthResponse::healthy(), |response, report| {
                response.with_check(ComponentHealth {
                    name: format!("subgraph:{}", report.service_id),
                    status: report.status,
                    message: Some(format!("{}ms", report.metrics.response_time_ms)),
                })
            })
    }
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        let status_code = match self.status {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK, // Still OK but with warning
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status_code, Json(self)).into_response()
    }
}

/// Liveness probe handler - `/health`
pub async fn health_handler() -> HealthResponse {
    HealthResponse::healthy_with_message("Gateway is running")
}

/// Readiness probe handler - `/ready`
///
/// Ready when at least one subgraph is registered; the status reflects the
/// latest probe of each subgraph without probing again.
pub async fn readiness_handler(State(registry): State<Arc<SubgraphRegistry>>) -> HealthResponse {
    if registry.services().is_empty() {
        return HealthResponse::degraded("No subgraphs registered");
    }
    registry.health_report()
}

/// Router exposing `/health` and `/ready` for the gateway process.
pub fn health_router(registry: Arc<SubgraphRegistry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_latency() {
        assert_eq!(classify(200, Duration::from_millis(50)), HealthStatus::Healthy);
        assert_eq!(classify(200, Duration::from_millis(300)), HealthStatus::Degraded);
        assert_eq!(classify(200, Duration::from_millis(600)), HealthStatus::Unhealthy);
        assert_eq!(classify(204, Duration::from_millis(99)), HealthStatus::Healthy);
        assert_eq!(classify(200, Duration::from_millis(100)), HealthStatus::Degraded);
        assert_eq!(classify(200, Duration::from_millis(500)), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_classify_by_status() {
        assert_eq!(classify(500, Duration::from_millis(1)), HealthStatus::Unhealthy);
        assert_eq!(classify(503, Duration::from_millis(1)), HealthStatus::Unhealthy);
        assert_eq!(classify(404, Duration::from_millis(1)), HealthStatus::Degraded);
        assert_eq!(classify(301, Duration::from_millis(1)), HealthStatus::Degraded);
    }

    #[test]
    fn test_component_health_propagation() {
        let response = HealthResponse::healthy()
            .with_check(ComponentHealth {
                name: "subgraph:users".to_string(),
                status: HealthStatus::Degraded,
                message: None,
            })
            .with_check(ComponentHealth {
                name: "subgraph:products".to_string(),
                status: HealthStatus::Unhealthy,
                message: None,
            });

        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(response.checks.len(), 2);
    }

    #[test]
    fn test_from_reports() {
        let reports = vec![
            HealthReport {
                status: HealthStatus::Healthy,
                service_id: "users".into(),
                last_check: Utc::now(),
                metrics: HealthMetrics {
                    response_time_ms: 12,
                    status_code: Some(200),
                    error_count: None,
                },
            },
            HealthReport {
                status: HealthStatus::Degraded,
                service_id: "reviews".into(),
                last_check: Utc::now(),
                metrics: HealthMetrics {
                    response_time_ms: 240,
                    status_code: Some(200),
                    error_count: None,
                },
            },
        ];

        let response = HealthResponse::from_reports(&reports);
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.checks[1].name, "subgraph:reviews");
    }

    #[test]
    fn test_health_status_serialization() {
        assert_eq!(serde_json::to_string(&HealthStatus::Healthy).unwrap(), "\"healthy\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Unhealthy).unwrap(), "\"unhealthy\"");
    }

    #[test]
    fn test_into_response_codes() {
        assert_eq!(HealthResponse::healthy().into_response().status(), StatusCode::OK);
        assert_eq!(HealthResponse::degraded("slow").into_response().status(), StatusCode::OK);
        let unhealthy = HealthResponse::healthy().with_check(ComponentHealth {
            name: "subgraph:a".into(),
            status: HealthStatus::Unhealthy,
            message: None,
        });
        assert_eq!(unhealthy.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_probe_unreachable_service_is_unhealthy() {
        let probe = HealthProbe::new(reqwest::Client::new(), Duration::from_millis(500));
        // Port 9 (discard) on localhost is not expected to serve HTTP
        let service = ServiceDefinition::new("ghost", "http://127.0.0.1:9");
        let report = probe.check(&service).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.metrics.error_count, Some(1));
        assert_eq!(report.service_id, "ghost");
    }
}

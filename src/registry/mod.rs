//! Subgraph registry: discovery, registration and health monitoring.
//!
//! The registry owns the [`ServiceStore`] and the latest [`HealthReport`] per
//! service. Discovery is either static (a configured list) or dynamic (polling
//! HTTP discovery endpoints). Changes to the service set are announced on a
//! broadcast channel so a composer can rebuild the supergraph; the registry
//! itself never recomposes.
//!
//! # Example
//!
//! ```rust,no_run
//! use graphql_federation_gateway::registry::{RegistryConfig, SubgraphRegistry};
//! use graphql_federation_gateway::ServiceDefinition;
//! use std::sync::Arc;
//!
//! # async fn example() -> graphql_federation_gateway::Result<()> {
//! let registry = Arc::new(SubgraphRegistry::new(RegistryConfig::with_static_services(vec![
//!     ServiceDefinition::new("users", "http://localhost:4001/graphql"),
//! ]))?);
//!
//! registry.discover().await?;
//! let monitor = registry.with_health_monitoring();
//! // ...
//! monitor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod store;

pub use store::ServiceStore;

use crate::error::{Error, Result};
use crate::health::{HealthProbe, HealthReport, HealthResponse, HealthStatus};
use crate::shutdown::BackgroundTask;
use crate::types::ServiceDefinition;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// How the registry finds its services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Use `static_services` verbatim
    #[default]
    Static,
    /// Poll `discovery_endpoints`
    Dynamic,
}

impl std::str::FromStr for DiscoveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(DiscoveryMode::Static),
            "dynamic" => Ok(DiscoveryMode::Dynamic),
            other => Err(Error::validation(format!("unknown discovery mode '{}'", other))),
        }
    }
}

/// Retry budget for one discovery endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based): `initial_delay * 2^retry`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub discovery_mode: DiscoveryMode,
    pub static_services: Vec<ServiceDefinition>,
    pub discovery_endpoints: Vec<String>,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub discovery_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            discovery_mode: DiscoveryMode::Static,
            static_services: Vec::new(),
            discovery_endpoints: Vec::new(),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RegistryConfig {
    /// Static discovery over a fixed list
    pub fn with_static_services(services: Vec<ServiceDefinition>) -> Self {
        Self {
            discovery_mode: DiscoveryMode::Static,
            static_services: services,
            ..Default::default()
        }
    }

    /// Dynamic discovery polling the given endpoints
    pub fn with_discovery_endpoints(endpoints: Vec<String>) -> Self {
        Self {
            discovery_mode: DiscoveryMode::Dynamic,
            discovery_endpoints: endpoints,
            ..Default::default()
        }
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn retry_policy(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.retry_policy = RetryPolicy {
            max_attempts,
            initial_delay,
        };
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.discovery_mode {
            DiscoveryMode::Static if self.static_services.is_empty() => Err(Error::validation(
                "static discovery mode requires at least one static service",
            )),
            DiscoveryMode::Dynamic if self.discovery_endpoints.is_empty() => Err(Error::validation(
                "dynamic discovery mode requires at least one discovery endpoint",
            )),
            _ if self.retry_policy.max_attempts == 0 => {
                Err(Error::validation("retry_policy.max_attempts must be greater than 0"))
            }
            _ => Ok(()),
        }
    }
}

/// Change notifications for the service set
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered(ServiceDefinition),
    Unregistered { id: String },
    Discovered { count: usize },
}

/// Check that `url` is an absolute http(s) URL.
pub fn validate_service_url(url: &str) -> std::result::Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid url '{}': {}", url, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported url scheme '{}'", parsed.scheme()));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(format!("url '{}' has no host", url));
    }
    Ok(())
}

/// Health probes run at once: `clamp(ceil(n / 3), 3, 10)`.
pub fn health_check_concurrency(services: usize) -> usize {
    services.div_ceil(3).clamp(3, 10)
}

/// Registry of subgraph services
pub struct SubgraphRegistry {
    config: RegistryConfig,
    store: ServiceStore,
    health: RwLock<HashMap<String, HealthReport>>,
    /// Ids removed by `unregister`; discovery does not bring them back
    unregistered: RwLock<HashSet<String>>,
    client: reqwest::Client,
    probe: HealthProbe,
    events: broadcast::Sender<RegistryEvent>,
}

impl SubgraphRegistry {
    /// Create a registry. Fails with a validation error on a bad config.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Create a registry sharing an existing HTTP client.
    pub fn with_client(config: RegistryConfig, client: reqwest::Client) -> Result<Self> {
        config.validate()?;
        let probe = HealthProbe::new(client.clone(), config.health_check_timeout);
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            config,
            store: ServiceStore::new(),
            health: RwLock::new(HashMap::new()),
            unregistered: RwLock::new(HashSet::new()),
            client,
            probe,
            events,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &ServiceStore {
        &self.store
    }

    /// Receive registration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register or replace a service.
    pub fn register(&self, service: ServiceDefinition) -> Result<()> {
        if service.id.trim().is_empty() {
            return Err(Error::registration("service id must not be empty"));
        }
        if service.url.trim().is_empty() {
            return Err(Error::registration("service url must not be empty")
                .with_context("serviceId", &service.id));
        }
        validate_service_url(&service.url).map_err(|reason| {
            Error::registration(reason)
                .with_context("serviceId", &service.id)
                .with_context("url", &service.url)
        })?;

        self.unregistered.write().remove(&service.id);
        let replaced = self.store.insert(service.clone());
        info!(
            service = %service.id,
            url = %service.url,
            replaced = replaced.is_some(),
            "Service registered"
        );
        let _ = self.events.send(RegistryEvent::Registered(service));
        Ok(())
    }

    /// Remove a service and its health record.
    ///
    /// The id stays out of the store across later discoveries until it is
    /// registered again.
    pub fn unregister(&self, id: &str) -> Result<()> {
        if self.store.remove(id).is_none() {
            return Err(Error::registration(format!("service '{}' is not registered", id))
                .with_context("serviceId", id));
        }
        self.unregistered.write().insert(id.to_string());
        self.health.write().remove(id);
        info!(service = %id, "Service unregistered");
        let _ = self.events.send(RegistryEvent::Unregistered { id: id.to_string() });
        Ok(())
    }

    /// Resolve the current service list and store it.
    ///
    /// Static mode returns the configured list verbatim. Dynamic mode never
    /// fails as a whole: endpoints that fail contribute no services. In both
    /// modes services removed with [`unregister`](Self::unregister) are
    /// returned but not stored again.
    #[instrument(skip(self), fields(mode = ?self.config.discovery_mode))]
    pub async fn discover(&self) -> Result<Vec<ServiceDefinition>> {
        let services = match self.config.discovery_mode {
            DiscoveryMode::Static => self.config.static_services.clone(),
            DiscoveryMode::Dynamic => {
                let discovered = discovery::discover_all(
                    &self.client,
                    &self.config.discovery_endpoints,
                    &self.config.retry_policy,
                )
                .await;
                discovered
                    .into_iter()
                    .filter(|service| match validate_service_url(&service.url) {
                        Ok(()) => true,
                        Err(reason) => {
                            warn!(service = %service.id, reason = %reason, "Ignoring discovered service");
                            false
                        }
                    })
                    .collect()
            }
        };

        let unregistered = self.unregistered.read();
        let mut skipped = 0;
        for service in &services {
            if unregistered.contains(&service.id) {
                skipped += 1;
                continue;
            }
            self.store.insert(service.clone());
        }
        drop(unregistered);
        debug!(count = services.len(), skipped, "Discovery complete");
        let _ = self.events.send(RegistryEvent::Discovered {
            count: services.len(),
        });
        Ok(services)
    }

    /// Probe a registered service.
    pub async fn health(&self, id: &str) -> Result<HealthReport> {
        let service = self.store.get(id).ok_or_else(|| {
            Error::health_check(format!("service '{}' is not registered", id))
                .with_context("serviceId", id)
        })?;
        Ok(self.perform_health_check(&service).await)
    }

    /// Probe `service` and keep the result as its latest report.
    pub async fn perform_health_check(&self, service: &ServiceDefinition) -> HealthReport {
        let report = self.probe.check(service).await;
        self.health.write().insert(service.id.clone(), report.clone());
        report
    }

    /// Probe every registered service with bounded concurrency.
    pub async fn check_all(&self) -> Vec<HealthReport> {
        let services = self.store.all();
        let concurrency = health_check_concurrency(services.len());
        stream::iter(services)
            .map(|service| async move { self.perform_health_check(&service).await })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    /// Registered services, sorted by id.
    pub fn services(&self) -> Vec<ServiceDefinition> {
        self.store.all()
    }

    pub fn service(&self, id: &str) -> Option<ServiceDefinition> {
        self.store.get(id)
    }

    /// Latest health report per service.
    pub fn health_snapshot(&self) -> HashMap<String, HealthReport> {
        self.health.read().clone()
    }

    /// Aggregate of the latest reports. Services never probed count as degraded.
    pub fn health_report(&self) -> HealthResponse {
        let health = self.health.read();
        let mut reports: Vec<HealthReport> = Vec::new();
        let mut unprobed = Vec::new();
        for id in self.store.ids() {
            match health.get(&id) {
                Some(report) => reports.push(report.clone()),
                None => unprobed.push(id),
            }
        }
        drop(health);

        unprobed.into_iter().fold(HealthResponse::from_reports(&reports), |response, id| {
            response.with_check(crate::health::ComponentHealth {
                name: format!("subgraph:{}", id),
                status: HealthStatus::Degraded,
                message: Some("not yet probed".to_string()),
            })
        })
    }

    /// Re-run discovery every `discovery_interval` until the task is stopped.
    pub fn with_auto_discovery(self: &Arc<Self>) -> BackgroundTask {
        let registry = Arc::clone(self);
        BackgroundTask::spawn("auto-discovery", self.config.discovery_interval, move || {
            let registry = Arc::clone(&registry);
            async move {
                if let Err(err) = registry.discover().await {
                    warn!(error = %err, "Auto discovery failed");
                }
            }
        })
    }

    /// Every `health_check_interval`, rediscover then probe all services.
    pub fn with_health_monitoring(self: &Arc<Self>) -> BackgroundTask {
        let registry = Arc::clone(self);
        BackgroundTask::spawn("health-monitoring", self.config.health_check_interval, move || {
            let registry = Arc::clone(&registry);
            async move {
                if let Err(err) = registry.discover().await {
                    warn!(error = %err, "Discovery before health check failed");
                }
                for report in registry.check_all().await {
                    match report.status {
                        HealthStatus::Healthy => debug!(
                            service = %report.service_id,
                            latency_ms = report.metrics.response_time_ms,
                            "Subgraph healthy"
                        ),
                        status => warn!(
                            service = %report.service_id,
                            status = %status,
                            latency_ms = report.metrics.response_time_ms,
                            status_code = ?report.metrics.status_code,
                            "Subgraph not healthy"
                        ),
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SubgraphRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubgraphRegistry")
            .field("discovery_mode", &self.config.discovery_mode)
            .field("services", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn static_registry() -> SubgraphRegistry {
        SubgraphRegistry::new(RegistryConfig::with_static_services(vec![
            ServiceDefinition::new("users", "http://users.local:4001/graphql"),
            ServiceDefinition::new("products", "http://products.local:4002/graphql"),
        ]))
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let err = SubgraphRegistry::new(RegistryConfig::with_static_services(vec![])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = SubgraphRegistry::new(RegistryConfig::with_discovery_endpoints(vec![])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let config = RegistryConfig::with_discovery_endpoints(vec!["http://registry/services".into()])
            .retry_policy(0, Duration::from_millis(10));
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_static_discover_returns_configured_list() {
        let registry = static_registry();
        let discovered = registry.discover().await.unwrap();
        assert_eq!(discovered, registry.config().static_services);
        assert_eq!(registry.services().len(), 2);
    }

    #[test]
    fn test_register_rejects_bad_definitions() {
        let registry = static_registry();
        for def in [
            ServiceDefinition::new("", "http://x/graphql"),
            ServiceDefinition::new("x", ""),
            ServiceDefinition::new("x", "not a url"),
            ServiceDefinition::new("x", "ftp://x/graphql"),
        ] {
            let err = registry.register(def).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Registration);
        }
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = static_registry();
        let mut events = registry.subscribe();

        registry
            .register(ServiceDefinition::new("reviews", "http://reviews-a/graphql"))
            .unwrap();
        registry
            .register(ServiceDefinition::new("reviews", "http://reviews-b/graphql").with_version("2"))
            .unwrap();

        let stored = registry.service("reviews").unwrap();
        assert_eq!(stored.url, "http://reviews-b/graphql");
        assert_eq!(stored.version.as_deref(), Some("2"));
        assert!(registry.store().get_by_url("http://reviews-a/graphql").is_none());

        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Registered(_))));
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Registered(_))));
    }

    #[test]
    fn test_unregister() {
        let registry = static_registry();
        registry
            .register(ServiceDefinition::new("reviews", "http://reviews/graphql"))
            .unwrap();
        let mut events = registry.subscribe();

        registry.unregister("reviews").unwrap();
        assert!(registry.service("reviews").is_none());
        assert_eq!(
            events.try_recv().ok(),
            Some(RegistryEvent::Unregistered { id: "reviews".into() })
        );

        let err = registry.unregister("reviews").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Registration);
    }

    #[tokio::test]
    async fn test_discover_keeps_unregistered_services_out() {
        let registry = static_registry();
        registry.discover().await.unwrap();
        registry.unregister("products").unwrap();

        let discovered = registry.discover().await.unwrap();
        assert_eq!(discovered.len(), 2);
        let ids: Vec<String> = registry.services().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["users".to_string()]);

        // Registering again lifts the exclusion
        registry
            .register(ServiceDefinition::new("products", "http://products.local:4002/graphql"))
            .unwrap();
        registry.discover().await.unwrap();
        assert_eq!(registry.services().len(), 2);
    }

    #[tokio::test]
    async fn test_health_of_unknown_service() {
        let registry = static_registry();
        let err = registry.health("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HealthCheck);
    }

    #[test]
    fn test_health_check_concurrency() {
        assert_eq!(health_check_concurrency(0), 3);
        assert_eq!(health_check_concurrency(4), 3);
        assert_eq!(health_check_concurrency(12), 4);
        assert_eq!(health_check_concurrency(100), 10);
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_discovery_mode_from_str() {
        assert_eq!("Dynamic".parse::<DiscoveryMode>().unwrap(), DiscoveryMode::Dynamic);
        assert!("mesh".parse::<DiscoveryMode>().is_err());
    }

    #[test]
    fn test_health_report_marks_unprobed_degraded() {
        let registry = static_registry();
        registry
            .register(ServiceDefinition::new("users", "http://users.local:4001/graphql"))
            .unwrap();
        let report = registry.health_report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks.len(), 1);
    }
}

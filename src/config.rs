//! Environment driven gateway configuration
//!
//! [`GatewayConfig::from_env`] reads the process environment,
//! [`GatewayConfig::from_lookup`] any `Fn(&str) -> Option<String>`. Unset or
//! empty variables keep the component defaults.
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `SERVER_PORT` | HTTP listen port (default 4000) |
//! | `ENV` | `production`/`prod` sanitizes client errors by default |
//! | `DISCOVERY_MODE` | `static` or `dynamic` |
//! | `STATIC_SERVICES` | `id=url,id=url` |
//! | `DISCOVERY_ENDPOINTS` | comma separated URLs |
//! | `DISCOVERY_INTERVAL_MS` | dynamic discovery period |
//! | `HEALTH_CHECK_INTERVAL_MS` / `HEALTH_CHECK_TIMEOUT_MS` | health monitoring |
//! | `DISCOVERY_MAX_ATTEMPTS` / `DISCOVERY_INITIAL_DELAY_MS` | discovery retry policy |
//! | `CIRCUIT_BREAKER_FAILURE_THRESHOLD` / `_RESET_TIMEOUT_MS` / `_HALF_OPEN_MAX_CALLS` | breaker |
//! | `SUBGRAPH_TIMEOUT_MS` | default subgraph call timeout |
//! | `ALLOW_PARTIAL_FAILURE` / `CRITICAL_SUBGRAPHS` | partial failure policy |
//! | `SANITIZE_ERRORS` | override the `ENV` based default |
//! | `QUERY_PLAN_CACHE_SIZE` / `QUERY_PLAN_CACHE_TTL_MS` | plan cache (`0` ttl never expires) |
//! | `DATALOADER_MAX_BATCH_SIZE` / `DATALOADER_BATCH_WINDOW_MS` | batching |
//! | `DATALOADER_CACHE_SIZE` / `DATALOADER_CACHE_TTL_MS` | read-only result cache (`0` size disables, `0` ttl never expires) |
//! | `METRICS_MAX_SAMPLES` | sample ring buffer capacity |
//! | `LOG_FORMAT` | `text` or `json` |
//!
//! `REDIS_URL` is accepted for compatibility and ignored: plans are cached
//! in process only.

use crate::error::{Error, Result};
use crate::executor::ExecutorConfig;
use crate::registry::{DiscoveryMode, RegistryConfig};
use crate::telemetry::{LogConfig, LogFormat};
use crate::types::ServiceDefinition;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Default HTTP listen port
pub const DEFAULT_PORT: u16 = 4000;

/// Complete gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub environment: String,
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
    pub log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            environment: "development".to_string(),
            registry: RegistryConfig::default(),
            executor: ExecutorConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let mut config = GatewayConfig::default();

        if let Some(port) = env.parse::<u16>("SERVER_PORT")? {
            config.port = port;
        }
        if let Some(environment) = env.get("ENV") {
            config.environment = environment;
        }

        let registry = &mut config.registry;
        if let Some(mode) = env.get("DISCOVERY_MODE") {
            registry.discovery_mode = DiscoveryMode::from_str(&mode)
                .map_err(|_| invalid("DISCOVERY_MODE", &mode, "static or dynamic"))?;
        }
        if let Some(raw) = env.get("STATIC_SERVICES") {
            registry.static_services = parse_static_services(&raw)?;
        }
        if let Some(raw) = env.get("DISCOVERY_ENDPOINTS") {
            registry.discovery_endpoints = split_list(&raw);
        }
        if let Some(interval) = env.millis("DISCOVERY_INTERVAL_MS")? {
            registry.discovery_interval = interval;
        }
        if let Some(interval) = env.millis("HEALTH_CHECK_INTERVAL_MS")? {
            registry.health_check_interval = interval;
        }
        if let Some(timeout) = env.millis("HEALTH_CHECK_TIMEOUT_MS")? {
            registry.health_check_timeout = timeout;
        }
        if let Some(attempts) = env.parse::<u32>("DISCOVERY_MAX_ATTEMPTS")? {
            registry.retry_policy.max_attempts = attempts;
        }
        if let Some(delay) = env.millis("DISCOVERY_INITIAL_DELAY_MS")? {
            registry.retry_policy.initial_delay = delay;
        }

        let production = config.is_production();
        let boundary = &mut config.executor.error_boundary;
        if let Some(threshold) = env.parse::<u32>("CIRCUIT_BREAKER_FAILURE_THRESHOLD")? {
            boundary.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(timeout) = env.millis("CIRCUIT_BREAKER_RESET_TIMEOUT_MS")? {
            boundary.circuit_breaker.reset_timeout = timeout;
        }
        if let Some(calls) = env.parse::<u32>("CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS")? {
            boundary.circuit_breaker.half_open_max_calls = calls;
        }
        if let Some(timeout) = env.millis("SUBGRAPH_TIMEOUT_MS")? {
            boundary.default_timeout = timeout;
        }
        if let Some(allow) = env.flag("ALLOW_PARTIAL_FAILURE")? {
            boundary.partial_failure.allow_partial_failure = allow;
        }
        if let Some(raw) = env.get("CRITICAL_SUBGRAPHS") {
            boundary.partial_failure.critical_subgraphs = split_list(&raw).into_iter().collect();
        }
        boundary.error_transformation.sanitize_errors = match env.flag("SANITIZE_ERRORS")? {
            Some(sanitize) => sanitize,
            None => production,
        };

        let executor = &mut config.executor;
        if let Some(size) = env.parse::<usize>("QUERY_PLAN_CACHE_SIZE")? {
            executor.plan_cache.max_size = size;
        }
        if let Some(ttl) = env.millis("QUERY_PLAN_CACHE_TTL_MS")? {
            executor.plan_cache.ttl = (!ttl.is_zero()).then_some(ttl);
        }
        if let Some(size) = env.parse::<usize>("DATALOADER_MAX_BATCH_SIZE")? {
            executor.data_loader.max_batch_size = size;
        }
        if let Some(window) = env.millis("DATALOADER_BATCH_WINDOW_MS")? {
            executor.data_loader.batch_window = (!window.is_zero()).then_some(window);
        }
        if let Some(entries) = env.parse::<usize>("DATALOADER_CACHE_SIZE")? {
            executor.data_loader.max_cache_entries = entries;
        }
        if let Some(ttl) = env.millis("DATALOADER_CACHE_TTL_MS")? {
            executor.data_loader.cache_ttl = (!ttl.is_zero()).then_some(ttl);
        }
        if let Some(samples) = env.parse::<usize>("METRICS_MAX_SAMPLES")? {
            executor.metrics_max_samples = samples;
        }

        if let Some(format) = env.get("LOG_FORMAT") {
            config.log.format =
                LogFormat::from_str(&format).map_err(|_| invalid("LOG_FORMAT", &format, "text or json"))?;
        }

        if env.get("REDIS_URL").is_some() {
            debug!("REDIS_URL is set but plans are cached in process only");
        }

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "prod")
    }

    /// Validate every component configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(invalid("SERVER_PORT", "0", "a port between 1 and 65535"));
        }
        self.registry.validate()?;
        self.executor.validate()
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        self.get(name)
            .map(|raw| raw.parse::<T>().map_err(|_| invalid(name, &raw, "a non-negative integer")))
            .transpose()
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>> {
        self.get(name)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(invalid(name, &raw, "true or false")),
            })
            .transpose()
    }
}

fn invalid(name: &str, raw: &str, expected: &str) -> Error {
    Error::validation(format!("{} must be {}, got '{}'", name, expected, raw))
        .with_context("variable", name)
        .with_context("value", raw)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `id=url,id=url`.
fn parse_static_services(raw: &str) -> Result<Vec<ServiceDefinition>> {
    split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((id, url)) if !id.trim().is_empty() && !url.trim().is_empty() => {
                Ok(ServiceDefinition::new(id.trim(), url.trim()))
            }
            _ => Err(invalid("STATIC_SERVICES", &entry, "a list of id=url pairs")),
        })
        .collect()
}

//! Polling discovery against HTTP service-list endpoints.
//!
//! An endpoint answers `GET` with `{"services": [{"id": ..., "url": ..., ...}]}`.
//! Endpoints are fetched concurrently, each with its own retry budget, and a
//! failed endpoint only costs the services it would have contributed.

use super::RetryPolicy;
use crate::error::{Error, Result};
use crate::types::ServiceDefinition;
use futures::stream::{self, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Endpoints fetched at the same time
pub const MAX_CONCURRENT_ENDPOINTS: usize = 3;

/// Per-request timeout for a discovery endpoint
pub const DISCOVERY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch every endpoint and return the merged, deduplicated service list.
///
/// When several endpoints report the same id the entry from the endpoint
/// listed last wins. Order of first appearance is preserved.
pub async fn discover_all(
    client: &reqwest::Client,
    endpoints: &[String],
    retry: &RetryPolicy,
) -> Vec<ServiceDefinition> {
    let mut results: Vec<(usize, Vec<ServiceDefinition>)> = stream::iter(endpoints.iter().cloned().enumerate())
        .map(|(index, endpoint)| async move {
            match fetch_with_retry(client, &endpoint, retry).await {
                Ok(services) => (index, services),
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "Discovery endpoint failed, skipping");
                    (index, Vec::new())
                }
            }
        })
        .buffer_unordered(MAX_CONCURRENT_ENDPOINTS)
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);
    dedup_last_wins(results.into_iter().flat_map(|(_, services)| services))
}

fn dedup_last_wins(services: impl IntoIterator<Item = ServiceDefinition>) -> Vec<ServiceDefinition> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<ServiceDefinition> = Vec::new();
    for service in services {
        match positions.get(&service.id) {
            Some(&pos) => merged[pos] = service,
            None => {
                positions.insert(service.id.clone(), merged.len());
                merged.push(service);
            }
        }
    }
    merged
}

/// Fetch one endpoint, retrying with exponential backoff.
#[instrument(skip(client, retry))]
pub async fn fetch_with_retry(
    client: &reqwest::Client,
    endpoint: &str,
    retry: &RetryPolicy,
) -> Result<Vec<ServiceDefinition>> {
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match fetch_endpoint(client, endpoint).await {
            Ok(services) => return Ok(services),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(err.with_context("attempts", attempt));
                }
                let backoff = retry.backoff(attempt - 1);
                debug!(
                    error = %err,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Discovery attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn fetch_endpoint(client: &reqwest::Client, endpoint: &str) -> Result<Vec<ServiceDefinition>> {
    let response = client
        .get(endpoint)
        .header(ACCEPT, "application/json")
        .header(CACHE_CONTROL, "max-age=30")
        .timeout(DISCOVERY_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            Error::discovery(format!("request to {} failed", endpoint))
                .with_context("endpoint", endpoint)
                .with_cause(e)
        })?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(Error::discovery(format!("{} returned HTTP {}", endpoint, status.as_u16()))
            .with_context("endpoint", endpoint)
            .with_context("status", status.as_u16()));
    }

    let body: Value = response.json().await.map_err(|e| {
        Error::discovery(format!("{} returned a non-JSON body", endpoint))
            .with_context("endpoint", endpoint)
            .with_cause(e)
    })?;

    let (services, dropped) = parse_services(&body);
    if dropped > 0 {
        warn!(endpoint = %endpoint, dropped, "Dropped malformed service entries");
    }
    debug!(endpoint = %endpoint, count = services.len(), "Discovered services");
    Ok(services)
}

/// Parse a discovery payload. Returns the well-formed entries and the number
/// of entries dropped for a missing or non-string `id`/`url`.
///
/// Fields other than the known ones are folded into `metadata`.
pub fn parse_services(body: &Value) -> (Vec<ServiceDefinition>, usize) {
    let Some(entries) = body.get("services").and_then(Value::as_array) else {
        return (Vec::new(), 0);
    };

    let mut dropped = 0;
    let services = entries
        .iter()
        .filter_map(|entry| {
            let parsed = parse_entry(entry);
            if parsed.is_none() {
                dropped += 1;
            }
            parsed
        })
        .collect();
    (services, dropped)
}

fn parse_entry(entry: &Value) -> Option<ServiceDefinition> {
    let object = entry.as_object()?;
    let id = object.get("id")?.as_str()?;
    let url = object.get("url")?.as_str()?;
    if id.is_empty() || url.is_empty() {
        return None;
    }

    let mut service = ServiceDefinition::new(id, url);
    service.name = object.get("name").and_then(Value::as_str).map(str::to_string);
    service.version = object.get("version").and_then(Value::as_str).map(str::to_string);

    let mut metadata: Map<String, Value> = object
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (key, value) in object {
        if !matches!(key.as_str(), "id" | "url" | "name" | "version" | "metadata") {
            metadata.insert(key.clone(), value.clone());
        }
    }
    if !metadata.is_empty() {
        service.metadata = Some(metadata);
    }
    Some(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_services_drops_malformed() {
        let body = json!({
            "services": [
                { "id": "users", "url": "http://users:4001/graphql", "version": "1.2.0" },
                { "id": "broken" },
                { "id": 7, "url": "http://numeric/graphql" },
                "not-an-object",
                { "id": "reviews", "url": "http://reviews:4002/graphql", "region": "eu-west-1" }
            ]
        });

        let (services, dropped) = parse_services(&body);
        assert_eq!(dropped, 3);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].version.as_deref(), Some("1.2.0"));
        assert_eq!(
            services[1].metadata.as_ref().and_then(|m| m.get("region")),
            Some(&json!("eu-west-1"))
        );
    }

    #[test]
    fn test_parse_services_without_list() {
        let (services, dropped) = parse_services(&json!({ "items": [] }));
        assert!(services.is_empty());
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_dedup_last_wins() {
        let merged = dedup_last_wins(vec![
            ServiceDefinition::new("users", "http://a/graphql"),
            ServiceDefinition::new("products", "http://p/graphql"),
            ServiceDefinition::new("users", "http://b/graphql"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "users");
        assert_eq!(merged[0].url, "http://b/graphql");
        assert_eq!(merged[1].id, "products");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_contributes_nothing() {
        let client = reqwest::Client::new();
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
        };
        let services = discover_all(&client, &["http://127.0.0.1:9/services".to_string()], &retry).await;
        assert!(services.is_empty());
    }
}

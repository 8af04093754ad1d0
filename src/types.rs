//! Shared data types for the federation gateway

use serde::{Deserialize, Serialize};

/// A subgraph service known to the gateway.
///
/// Definitions are immutable once stored; re-registering the same `id`
/// replaces the previous definition wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    /// Unique service id
    pub id: String,
    /// Absolute URL of the subgraph GraphQL endpoint
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ServiceDefinition {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: None,
            version: None,
            metadata: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    /// URL of the subgraph health probe, `{url}/health`.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.url.trim_end_matches('/'))
    }
}

/// GraphQL request from client
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// GraphQL query string
    #[serde(default)]
    pub query: String,

    /// Operation name (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// Variables for the query
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// GraphQL response to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// Response data. Serialized as `null` when execution produced nothing.
    #[serde(default)]
    pub data: Option<serde_json::Value>,

    /// Errors if any
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<crate::error::GraphQLError>,
}

impl GraphQLResponse {
    /// Create a successful response
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// Create an error response
    pub fn error(error: crate::error::GraphQLError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }

    /// Create an error response from multiple errors
    pub fn errors(errors: Vec<crate::error::GraphQLError>) -> Self {
        Self { data: None, errors }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_definition_serde() {
        let json = serde_json::json!({
            "id": "users",
            "url": "http://users.internal:4001/graphql",
            "version": "2.1.0"
        });
        let def: ServiceDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def.id, "users");
        assert_eq!(def.version.as_deref(), Some("2.1.0"));
        assert!(def.metadata.is_none());

        let out = serde_json::to_value(&def).unwrap();
        assert!(out.get("name").is_none());
    }

    #[test]
    fn test_health_url_strips_trailing_slash() {
        let def = ServiceDefinition::new("a", "http://a.local/graphql/");
        assert_eq!(def.health_url(), "http://a.local/graphql/health");
    }

    #[test]
    fn test_response_serializes_null_data() {
        let response = GraphQLResponse::errors(vec![]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({ "data": null }));
    }
}

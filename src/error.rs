//! Error types for the federation gateway
//!
//! Every failure the gateway can produce is one of a closed set of kinds. Each
//! kind carries a message, a free-form context map and an optional cause, and
//! exposes a stable `code`, a [`Severity`] and whether a caller may retry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// How bad an error is for the request that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Discriminant of [`Error`], useful for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    SchemaValidation,
    EntityResolution,
    FieldResolution,
    Federation,
    CircuitBreaker,
    Timeout,
    Composition,
    TypeConversion,
    HealthCheck,
    Registration,
    Discovery,
}

impl ErrorKind {
    /// Machine readable code placed in GraphQL error extensions
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::SchemaValidation => "SCHEMA_VALIDATION_ERROR",
            ErrorKind::EntityResolution => "ENTITY_RESOLUTION_ERROR",
            ErrorKind::FieldResolution => "FIELD_RESOLUTION_ERROR",
            ErrorKind::Federation => "FEDERATION_ERROR",
            ErrorKind::CircuitBreaker => "CIRCUIT_BREAKER_OPEN",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Composition => "COMPOSITION_ERROR",
            ErrorKind::TypeConversion => "TYPE_CONVERSION_ERROR",
            ErrorKind::HealthCheck => "HEALTH_CHECK_ERROR",
            ErrorKind::Registration => "REGISTRATION_ERROR",
            ErrorKind::Discovery => "DISCOVERY_ERROR",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::Validation | ErrorKind::FieldResolution | ErrorKind::HealthCheck => {
                Severity::Low
            }
            ErrorKind::SchemaValidation
            | ErrorKind::EntityResolution
            | ErrorKind::CircuitBreaker
            | ErrorKind::Timeout
            | ErrorKind::TypeConversion
            | ErrorKind::Registration
            | ErrorKind::Discovery => Severity::Medium,
            ErrorKind::Federation | ErrorKind::Composition => Severity::High,
        }
    }

    /// Whether the same operation may succeed if attempted again
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::EntityResolution
            | ErrorKind::FieldResolution
            | ErrorKind::CircuitBreaker
            | ErrorKind::Timeout
            | ErrorKind::Registration
            | ErrorKind::Discovery
            | ErrorKind::HealthCheck => true,
            ErrorKind::Validation
            | ErrorKind::SchemaValidation
            | ErrorKind::Federation
            | ErrorKind::Composition
            | ErrorKind::TypeConversion => false,
        }
    }

    /// Message shown to clients when details must not leak
    fn public_message(self) -> &'static str {
        match self {
            ErrorKind::Validation => "Invalid request",
            ErrorKind::CircuitBreaker => "Service temporarily unavailable",
            ErrorKind::Timeout => "Request timed out",
            ErrorKind::EntityResolution | ErrorKind::FieldResolution => {
                "Failed to resolve requested data"
            }
            _ => "An internal error occurred",
        }
    }
}

/// Structured context attached to an [`Error`].
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    values: serde_json::Map<String, serde_json::Value>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ErrorContext {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.values
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

/// Main error type for the gateway
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation { message: String, context: ErrorContext },

    #[error("Schema validation error: {message}")]
    SchemaValidation { message: String, context: ErrorContext },

    #[error("Entity resolution error: {message}")]
    EntityResolution { message: String, context: ErrorContext },

    #[error("Field resolution error: {message}")]
    FieldResolution { message: String, context: ErrorContext },

    #[error("Federation error: {message}")]
    Federation { message: String, context: ErrorContext },

    #[error("Circuit breaker open: {message}")]
    CircuitBreaker { message: String, context: ErrorContext },

    #[error("Timeout: {message}")]
    Timeout { message: String, context: ErrorContext },

    #[error("Composition error: {message}")]
    Composition { message: String, context: ErrorContext },

    #[error("Type conversion error: {message}")]
    TypeConversion { message: String, context: ErrorContext },

    #[error("Health check error: {message}")]
    HealthCheck { message: String, context: ErrorContext },

    #[error("Registration error: {message}")]
    Registration { message: String, context: ErrorContext },

    #[error("Discovery error: {message}")]
    Discovery { message: String, context: ErrorContext },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into(), context: ErrorContext::default() }
    }

    pub fn schema_validation(message: impl Into<String>) -> Self {
        Error::SchemaValidation { message: message.into(), context: ErrorContext::default() }
    }

    pub fn entity_resolution(message: impl Into<String>) -> Self {
        Error::EntityResolution { message: message.into(), context: ErrorContext::default() }
    }

    pub fn field_resolution(message: impl Into<String>) -> Self {
        Error::FieldResolution { message: message.into(), context: ErrorContext::default() }
    }

    pub fn federation(message: impl Into<String>) -> Self {
        Error::Federation { message: message.into(), context: ErrorContext::default() }
    }

    pub fn circuit_breaker(message: impl Into<String>) -> Self {
        Error::CircuitBreaker { message: message.into(), context: ErrorContext::default() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout { message: message.into(), context: ErrorContext::default() }
    }

    pub fn composition(message: impl Into<String>) -> Self {
        Error::Composition { message: message.into(), context: ErrorContext::default() }
    }

    pub fn type_conversion(message: impl Into<String>) -> Self {
        Error::TypeConversion { message: message.into(), context: ErrorContext::default() }
    }

    pub fn health_check(message: impl Into<String>) -> Self {
        Error::HealthCheck { message: message.into(), context: ErrorContext::default() }
    }

    pub fn registration(message: impl Into<String>) -> Self {
        Error::Registration { message: message.into(), context: ErrorContext::default() }
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Error::Discovery { message: message.into(), context: ErrorContext::default() }
    }

    /// Attach a context value. Values that fail to serialize are stored as null.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.context_mut().values.insert(key.into(), value);
        self
    }

    /// Attach the underlying error that caused this one.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.context_mut().cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            Error::EntityResolution { .. } => ErrorKind::EntityResolution,
            Error::FieldResolution { .. } => ErrorKind::FieldResolution,
            Error::Federation { .. } => ErrorKind::Federation,
            Error::CircuitBreaker { .. } => ErrorKind::CircuitBreaker,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Composition { .. } => ErrorKind::Composition,
            Error::TypeConversion { .. } => ErrorKind::TypeConversion,
            Error::HealthCheck { .. } => ErrorKind::HealthCheck,
            Error::Registration { .. } => ErrorKind::Registration,
            Error::Discovery { .. } => ErrorKind::Discovery,
        }
    }

    pub fn message(&self) -> &str {
        self.parts().0
    }

    pub fn context(&self) -> &ErrorContext {
        self.parts().1
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub fn severity(&self) -> Severity {
        self.kind().severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Human readable chain of this error and its causes, outermost first.
    pub fn stack(&self) -> Vec<String> {
        let mut frames = vec![self.to_string()];
        let mut next: Option<&(dyn std::error::Error + 'static)> = self
            .context()
            .cause()
            .map(|c| c as &(dyn std::error::Error + 'static));
        while let Some(err) = next {
            frames.push(err.to_string());
            next = err.source();
        }
        frames
    }

    /// Convert error to GraphQL error format
    ///
    /// # Security
    ///
    /// In production (ENV=production), error details are replaced by a
    /// generic per-kind message to prevent information disclosure.
    pub fn to_graphql_error(&self) -> GraphQLError {
        self.to_graphql_error_with(is_production())
    }

    /// Convert to GraphQL error format, sanitizing the message when asked to.
    pub fn to_graphql_error_with(&self, sanitize: bool) -> GraphQLError {
        let message = if sanitize {
            self.kind().public_message().to_string()
        } else {
            self.to_string()
        };
        let mut error = GraphQLError::new(message, self.code());
        if !sanitize {
            for (key, value) in self.context().values() {
                error.extensions.insert(key.clone(), value.clone());
            }
        }
        error
    }

    fn parts(&self) -> (&str, &ErrorContext) {
        match self {
            Error::Validation { message, context }
            | Error::SchemaValidation { message, context }
            | Error::EntityResolution { message, context }
            | Error::FieldResolution { message, context }
            | Error::Federation { message, context }
            | Error::CircuitBreaker { message, context }
            | Error::Timeout { message, context }
            | Error::Composition { message, context }
            | Error::TypeConversion { message, context }
            | Error::HealthCheck { message, context }
            | Error::Registration { message, context }
            | Error::Discovery { message, context } => (message, context),
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Error::Validation { context, .. }
            | Error::SchemaValidation { context, .. }
            | Error::EntityResolution { context, .. }
            | Error::FieldResolution { context, .. }
            | Error::Federation { context, .. }
            | Error::CircuitBreaker { context, .. }
            | Error::Timeout { context, .. }
            | Error::Composition { context, .. }
            | Error::TypeConversion { context, .. }
            | Error::HealthCheck { context, .. }
            | Error::Registration { context, .. }
            | Error::Discovery { context, .. } => context,
        }
    }
}

/// Whether the process runs with a production `ENV`.
pub fn is_production() -> bool {
    std::env::var("ENV")
        .map(|e| e == "production" || e == "prod")
        .unwrap_or(false)
}

/// GraphQL error response format
///
/// Extensions always carry a `code` and an RFC 3339 `timestamp`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>, code: &str) -> Self {
        let mut extensions = HashMap::new();
        extensions.insert("code".to_string(), serde_json::json!(code));
        extensions.insert(
            "timestamp".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
        Self {
            message: message.into(),
            extensions,
        }
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.extensions.get("code").and_then(|c| c.as_str())
    }
}

impl From<Error> for GraphQLError {
    fn from(err: Error) -> Self {
        err.to_graphql_error()
    }
}

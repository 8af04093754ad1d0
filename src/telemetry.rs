//! Logging setup
//!
//! Installs a `tracing_subscriber` pipeline: an [`EnvFilter`] read from
//! `RUST_LOG` (falling back to [`LogConfig::default_directive`]) and a
//! `fmt` layer writing either compact text or one JSON object per line.
//!
//! ```rust,no_run
//! use graphql_federation_gateway::telemetry::{init_logging, LogConfig, LogFormat};
//!
//! # fn example() -> graphql_federation_gateway::Result<()> {
//! init_logging(&LogConfig::default().with_format(LogFormat::Json))?;
//! tracing::info!(port = 4000, "Gateway starting");
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "pretty" | "compact" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::validation(format!("unknown log format '{}'", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub default_directive: String,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            default_directive: "info".to_string(),
            with_target: false,
        }
    }
}

impl LogConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_from_default_env().or_else(|_| {
            EnvFilter::try_new(&self.default_directive).map_err(|e| {
                Error::validation(format!("invalid log directive '{}'", self.default_directive)).with_cause(e)
            })
        })
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;
    let json = config.format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_target(config.with_target)))
        .with((!json).then(|| fmt::layer().with_target(config.with_target)))
        .try_init()
        .map_err(|e| Error::validation("a global tracing subscriber is already installed").with_cause(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_invalid_default_directive() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LogConfig::default().with_default_directive("gateway=loudest");
        assert!(config.filter().is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig::default().with_default_directive("warn");
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}

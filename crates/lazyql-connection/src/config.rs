//! Lazy connection configuration

use std::time::Duration;

use lazyql_core::{LazyqlError, Result};
use serde::{Deserialize, Serialize};

/// Idle period used when the URI does not carry an `idle` parameter
pub const DEFAULT_IDLE_PERIOD: Duration = Duration::from_secs(60);

/// Configuration for a lazy connection
///
/// Controls how long the physical connection may sit unused before it is
/// retired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyConfig {
    /// Time without pending operations before disconnecting (None = never)
    idle_period: Option<Duration>,
}

impl LazyConfig {
    pub fn new() -> Self {
        Self {
            idle_period: Some(DEFAULT_IDLE_PERIOD),
        }
    }

    /// Read the options recognized in a connection URI.
    ///
    /// Only `idle` (seconds, fractions allowed) is interpreted; a negative
    /// value disables idle disconnection. Every other parameter belongs to the
    /// connection factory and is ignored here.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let mut config = Self::new();

        let query = uri
            .split_once('?')
            .map(|(_, rest)| rest.split('#').next().unwrap_or_default())
            .unwrap_or_default();

        if let Some((_, idle)) = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "idle")
        {
            config.idle_period = parse_idle_period(&idle)?;
        }

        Ok(config)
    }

    /// Set the idle period
    pub fn with_idle_period(mut self, period: Duration) -> Self {
        self.idle_period = Some(period);
        self
    }

    /// Keep the physical connection until it is closed explicitly
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_period = None;
        self
    }

    /// Get the idle period, if idle disconnection is enabled
    pub fn idle_period(&self) -> Option<Duration> {
        self.idle_period
    }
}

impl Default for LazyConfig {
    /// Default configuration: disconnect after 60 idle seconds
    fn default() -> Self {
        Self::new()
    }
}

fn parse_idle_period(value: &str) -> Result<Option<Duration>> {
    let seconds: f64 = value
        .trim()
        .parse()
        .map_err(|_| LazyqlError::Configuration(format!("invalid idle period: {:?}", value)))?;

    if !seconds.is_finite() {
        return Err(LazyqlError::Configuration(format!(
            "invalid idle period: {:?}",
            value
        )));
    }
    if seconds < 0.0 {
        return Ok(None);
    }

    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|e| LazyqlError::Configuration(format!("idle period out of range: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_idle_period() {
        let config = LazyConfig::default();
        assert_eq!(config.idle_period(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_uri_without_query_uses_default() {
        let config = LazyConfig::from_uri("user:secret@localhost/test").unwrap();
        assert_eq!(config, LazyConfig::default());
    }

    #[test]
    fn test_uri_idle_seconds() {
        let config = LazyConfig::from_uri("mysql://localhost/test?idle=10").unwrap();
        assert_eq!(config.idle_period(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_uri_fractional_idle() {
        let config = LazyConfig::from_uri("localhost?idle=0.01").unwrap();
        assert_eq!(config.idle_period(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_uri_zero_idle() {
        let config = LazyConfig::from_uri("localhost?idle=0").unwrap();
        assert_eq!(config.idle_period(), Some(Duration::ZERO));
    }

    #[test]
    fn test_uri_negative_idle_disables_timeout() {
        let config = LazyConfig::from_uri("localhost?idle=-1").unwrap();
        assert_eq!(config.idle_period(), None);
    }

    #[test]
    fn test_uri_idle_among_other_parameters() {
        let config =
            LazyConfig::from_uri("user@localhost:3306/db?timeout=5&idle=2.5&charset=utf8mb4#frag")
                .unwrap();
        assert_eq!(config.idle_period(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_uri_invalid_idle() {
        let result = LazyConfig::from_uri("localhost?idle=soon");
        assert!(matches!(result, Err(LazyqlError::Configuration(_))));

        let result = LazyConfig::from_uri("localhost?idle=NaN");
        assert!(matches!(result, Err(LazyqlError::Configuration(_))));

        let result = LazyConfig::from_uri("localhost?idle=-inf");
        assert!(matches!(result, Err(LazyqlError::Configuration(_))));
    }

    #[test]
    fn test_uri_huge_idle_is_rejected() {
        let result = LazyConfig::from_uri("localhost?idle=1e300");
        assert!(matches!(result, Err(LazyqlError::Configuration(_))));
    }

    #[test]
    fn test_builder() {
        let config = LazyConfig::new().with_idle_period(Duration::from_secs(5));
        assert_eq!(config.idle_period(), Some(Duration::from_secs(5)));

        let config = config.without_idle_timeout();
        assert_eq!(config.idle_period(), None);
    }

    #[test]
    fn test_serialization() {
        let config = LazyConfig::new().with_idle_period(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LazyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}

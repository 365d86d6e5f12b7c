//! Configuration for the correlation tracker
//!
//! The host pipeline is expected to deserialize this from its own config
//! file and hand over an already-validated value.

use crate::error::{CorrelationError, CorrelationResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Correlation tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Base URL of the backend correlation API
    pub endpoint: String,

    /// Access token sent with every API request (optional)
    pub access_token: Option<String>,

    /// Resource attribute name → dimension name mapping to extract
    pub sync_attributes: HashMap<String, String>,

    /// Capacity of the outbound request queue
    pub max_queue_size: usize,

    /// Number of dispatch workers
    pub worker_count: usize,

    /// Seconds after which a confirmed correlation is re-sent on observation
    pub stale_secs: u64,

    /// Seconds after which an unobserved entry expires and is disassociated
    pub ttl_secs: u64,

    /// Maximum entries held in the correlation cache
    pub max_cache_entries: usize,

    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,

    /// Maximum retry attempts for transient failures
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds (doubles with each retry)
    pub retry_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    pub retry_backoff_max_ms: u64,

    /// Token-bucket rate limit for outbound requests
    pub requests_per_second: u32,

    /// Minimum seconds between opportunistic cache eviction sweeps
    pub cleanup_interval_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9080".to_string(),
            access_token: None,
            sync_attributes: HashMap::from([("host.name".to_string(), "host".to_string())]),
            max_queue_size: 10_000,
            worker_count: 4,
            stale_secs: 300,
            ttl_secs: 3600,
            max_cache_entries: 10_000,
            http_timeout_secs: 10,
            max_retries: 3,
            retry_backoff_ms: 500,
            retry_backoff_max_ms: 30_000,
            requests_per_second: 20,
            cleanup_interval_secs: 60,
        }
    }
}

impl CorrelationConfig {
    /// Validate the configuration
    pub fn validate(&self) -> CorrelationResult<()> {
        Url::parse(&self.endpoint)?;

        if self.max_queue_size == 0 {
            return Err(CorrelationError::Config(
                "max_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(CorrelationError::Config(
                "worker_count must be greater than zero".to_string(),
            ));
        }
        if self.max_cache_entries == 0 {
            return Err(CorrelationError::Config(
                "max_cache_entries must be greater than zero".to_string(),
            ));
        }
        if self.requests_per_second == 0 {
            return Err(CorrelationError::Config(
                "requests_per_second must be greater than zero".to_string(),
            ));
        }
        if self.sync_attributes.is_empty() {
            return Err(CorrelationError::Config(
                "sync_attributes must name at least one attribute".to_string(),
            ));
        }

        Ok(())
    }

    /// Staleness window as a duration
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    /// Entry time-to-live as a duration
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Per-request HTTP timeout as a duration
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Initial retry backoff as a duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Maximum retry backoff as a duration
    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    /// Eviction sweep interval as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CorrelationConfig::default();
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.stale_secs, 300);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.requests_per_second, 20);
        assert_eq!(
            config.sync_attributes.get("host.name").map(String::as_str),
            Some("host")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = CorrelationConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = CorrelationConfig {
            max_queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CorrelationConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CorrelationConfig {
            requests_per_second: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = CorrelationConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CorrelationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_queue_size, config.max_queue_size);
        assert_eq!(parsed.endpoint, config.endpoint);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: CorrelationConfig =
            serde_json::from_str(r#"{"endpoint": "https://api.example.com"}"#).unwrap();
        assert_eq!(parsed.endpoint, "https://api.example.com");
        assert_eq!(parsed.worker_count, 4);
        assert_eq!(parsed.ttl_secs, 3600);
    }
}

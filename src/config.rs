//! Engine configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! { "user_agent": "my-app/1.0", "max_redirects": 5, "retry": { "max_attempts": 0 } }
//! ```

use crate::base::neterror::NetError;
use crate::transport::{HttpTransportConfig, RetryConfig};
use serde::{Deserialize, Serialize};
#[cfg(feature = "json")]
use std::path::Path;

/// Configuration options for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// User-Agent sent when the request does not set one.
    pub user_agent: String,

    /// Redirects a request may follow before failing with
    /// [`NetError::TooManyRedirects`].
    pub max_redirects: usize,

    /// Connection retry policy of the HTTP transport.
    pub retry: RetryConfig,

    /// Size of the buffer handed to upload providers, and of each body
    /// chunk sent.
    pub upload_buffer_size: usize,

    /// Name of the thread running network I/O.
    pub network_thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("cronet-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 20,
            retry: RetryConfig::default(),
            upload_buffer_size: 8192,
            network_thread_name: "cronet-network".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    #[cfg(feature = "json")]
    pub fn from_json_str(json: &str) -> Result<Self, NetError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| NetError::invalid_argument(format!("Invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    #[cfg(feature = "json")]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, NetError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            NetError::invalid_argument(format!(
                "Cannot read engine config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    #[cfg(feature = "json")]
    pub fn to_json_string(&self) -> Result<String, NetError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| NetError::invalid_argument(format!("Invalid engine config: {}", e)))
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.upload_buffer_size == 0 {
            return Err(NetError::invalid_argument(
                "upload_buffer_size must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(NetError::invalid_argument(
                "retry.jitter_factor must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Settings for the default [`HttpTransport`](crate::transport::HttpTransport).
    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            user_agent: self.user_agent.clone(),
            retry: self.retry.clone(),
            upload_chunk_size: self.upload_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_redirects, 20);
        assert_eq!(config.upload_buffer_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"max_redirects": 3, "retry": {"max_attempts": 0}}"#)
                .unwrap();
        assert_eq!(config.max_redirects, 3);
        assert_eq!(config.retry.max_attempts, 0);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.network_thread_name, "cronet-network");
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_rejects_bad_values() {
        let err = EngineConfig::from_json_str(r#"{"upload_buffer_size": 0}"#).unwrap_err();
        assert!(err.is_usage_error());
        assert!(EngineConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_transport_config_follows_engine() {
        let config = EngineConfig {
            user_agent: "agent/1".into(),
            upload_buffer_size: 100,
            ..Default::default()
        };
        let transport = config.transport_config();
        assert_eq!(transport.user_agent, "agent/1");
        assert_eq!(transport.upload_chunk_size, 100);
    }
}

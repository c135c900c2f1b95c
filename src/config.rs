//! Configuration management for the preview cache proxy

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the proxy
///
/// Loaded once at startup and shared read-only (`Arc<ProxyConfig>`) with every
/// component that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the HTTP front listens on (default: 0.0.0.0:5000)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Directory holding cache data and completion marker files
    /// (default: the OS temporary directory)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Chunk bound for client-facing streams in bytes (default: 512KB)
    /// Valid range: 64KB to 4MB
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Chunk bound for background full fetches in bytes (default: 2MB)
    /// Valid range: 256KB to 16MB
    #[serde(default = "default_fetch_chunk_size")]
    pub fetch_chunk_size: usize,

    /// Connect and initial-response timeout for origin requests (default: 10s)
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout_secs: u64,

    /// User-Agent forwarded when the client sent none
    #[serde(default = "default_user_agent")]
    pub default_user_agent: String,

    /// Display title used when the client sent none
    #[serde(default = "default_title")]
    pub default_title: String,

    /// Upper bound on bytes held by cache data files. When reached, new
    /// populations are not started; nothing is evicted.
    #[serde(default)]
    pub max_cache_bytes: Option<u64>,

    /// JSON file with per-domain credentials for the metadata resolver
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Configuration for the standalone metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_stream_chunk_size() -> usize {
    512 * 1024 // 512KB
}

fn default_fetch_chunk_size() -> usize {
    2 * 1024 * 1024 // 2MB
}

fn default_origin_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    "default-user-agent".to_string()
}

fn default_title() -> String {
    "video".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: default_listen_address(),
            cache_dir: None,
            stream_chunk_size: default_stream_chunk_size(),
            fetch_chunk_size: default_fetch_chunk_size(),
            origin_timeout_secs: default_origin_timeout(),
            default_user_agent: default_user_agent(),
            default_title: default_title(),
            max_cache_bytes: None,
            credentials_file: None,
            metrics_endpoint: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: ProxyConfig = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - stream_chunk_size must be between 64KB and 4MB
    /// - fetch_chunk_size must be between 256KB and 16MB
    /// - origin_timeout_secs must be > 0
    /// - max_cache_bytes, when set, must be > 0
    /// - metrics address must parse when the endpoint is enabled
    pub fn validate(&self) -> Result<()> {
        const MIN_STREAM_CHUNK: usize = 64 * 1024;
        const MAX_STREAM_CHUNK: usize = 4 * 1024 * 1024;
        const MIN_FETCH_CHUNK: usize = 256 * 1024;
        const MAX_FETCH_CHUNK: usize = 16 * 1024 * 1024;

        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            ProxyError::ConfigError(format!(
                "listen_address '{}' is not a socket address: {}",
                self.listen_address, e
            ))
        })?;

        if self.stream_chunk_size < MIN_STREAM_CHUNK || self.stream_chunk_size > MAX_STREAM_CHUNK {
            return Err(ProxyError::ConfigError(format!(
                "stream_chunk_size must be between {}KB and {}MB, got {} bytes",
                MIN_STREAM_CHUNK / 1024,
                MAX_STREAM_CHUNK / (1024 * 1024),
                self.stream_chunk_size
            )));
        }

        if self.fetch_chunk_size < MIN_FETCH_CHUNK || self.fetch_chunk_size > MAX_FETCH_CHUNK {
            return Err(ProxyError::ConfigError(format!(
                "fetch_chunk_size must be between {}KB and {}MB, got {} bytes",
                MIN_FETCH_CHUNK / 1024,
                MAX_FETCH_CHUNK / (1024 * 1024),
                self.fetch_chunk_size
            )));
        }

        if self.origin_timeout_secs == 0 {
            return Err(ProxyError::ConfigError(
                "origin_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.max_cache_bytes == Some(0) {
            return Err(ProxyError::ConfigError(
                "max_cache_bytes must be greater than 0 when set".to_string(),
            ));
        }

        if let Some(endpoint) = &self.metrics_endpoint {
            if endpoint.enabled {
                endpoint.address.parse::<SocketAddr>().map_err(|e| {
                    ProxyError::ConfigError(format!(
                        "metrics_endpoint.address '{}' is not a socket address: {}",
                        endpoint.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Directory that holds cache entries
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Origin connect / initial response timeout
    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout_secs)
    }
}

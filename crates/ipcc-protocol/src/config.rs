//! Configuration structures for protocol clients

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Default User-Agent for catalog and archive requests
pub const DEFAULT_USER_AGENT: &str = concat!("ipcc-protocol/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout, covering the whole body transfer
    pub request_timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Proxy URL applied to all schemes
    pub proxy: Option<String>,

    /// User-Agent header value
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1000),
            connect_timeout: Duration::from_secs(30),
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HttpConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            request_timeout: Duration::from_secs(
                std::env::var("IPCC_REQUEST_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            connect_timeout: Duration::from_secs(
                std::env::var("IPCC_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            proxy: std::env::var("IPCC_HTTP_PROXY").ok().filter(|s| !s.is_empty()),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum request attempts per archive
    pub max_attempts: u32,

    /// Fixed delay between attempts
    pub retry_delay: Duration,

    /// Fail instead of warning when the final digest does not match
    pub strict_hash: bool,

    /// Flush the partial file after this many bytes
    pub flush_interval: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(5),
            strict_hash: false,
            flush_interval: 1024 * 1024,
        }
    }
}

impl DownloadConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_attempts: std::env::var("IPCC_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            retry_delay: Duration::from_secs(
                std::env::var("IPCC_RETRY_DELAY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            strict_hash: std::env::var("IPCC_STRICT_HASH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(false),
            flush_interval: 1024 * 1024,
        })
    }
}

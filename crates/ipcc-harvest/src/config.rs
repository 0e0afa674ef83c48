//! Harvester configuration.
//!
//! Configuration can be provided via:
//! - CLI arguments (`--jobs`, `--product`, etc.)
//! - Environment variables (`IPCC_JOBS`, `IPCC_PRODUCT`, etc.)
//! - Default values
//!
//! It is parsed once in `main` and handed to the components as plain values.
//!
//! # Example
//!
//! ```no_run
//! use ipcc_harvest::HarvestConfig;
//!
//! let config = HarvestConfig::from_args();
//! config.validate().expect("Invalid configuration");
//!
//! println!("Running {} jobs in {}", config.jobs, config.work_dir.display());
//! ```

use clap::Parser;
use ipcc_protocol::{DEFAULT_CATALOG_URL, DEFAULT_KEY_BASE_URL, DownloadConfig, HttpConfig};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HarvestError, Result};
use crate::pipeline::PipelineOptions;
use crate::products::ProductSet;

/// Harvester configuration loaded from CLI args and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ipcc-harvest",
    about = "Download firmware archives and harvest their carrier bundles",
    version
)]
pub struct HarvestConfig {
    /// Commit and push results to the `files` branch of the working repository
    #[arg(short = 'g', long, env = "IPCC_UPLOAD_GITHUB")]
    pub upload_github: bool,

    /// Proxy URL for every HTTP request
    #[arg(long, env = "IPCC_HTTP_PROXY")]
    pub http_proxy: Option<String>,

    /// Number of devices processed concurrently
    #[arg(short = 'j', long, env = "IPCC_JOBS", default_value_t = 3)]
    pub jobs: usize,

    /// Drop the oldest N firmwares of every device
    #[arg(long, env = "IPCC_FIRMWARE_SKIP", default_value_t = 0)]
    pub firmware_skip: usize,

    /// Drop the oldest N product codes of each family
    #[arg(long, env = "IPCC_PRODUCT_SKIP", default_value_t = 0)]
    pub product_skip: usize,

    /// Minimum firmware major version
    #[arg(long, env = "IPCC_MIN_FIRMWARE")]
    pub min_firmware: Option<u32>,

    /// Only this model (e.g. `iPhone9,1`)
    #[arg(long, env = "IPCC_PRODUCT")]
    pub product: Option<String>,

    /// Only this firmware version
    #[arg(long, env = "IPCC_FIRMWARE")]
    pub firmware: Option<String>,

    /// Give previously ignored firmwares one more attempt
    #[arg(long, env = "IPCC_RETRY_IGNORED")]
    pub retry_ignored: bool,

    /// Directory holding one subdirectory per device
    #[arg(long, env = "IPCC_WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    /// Device catalog endpoint; the model is appended
    #[arg(long, env = "IPCC_CATALOG_URL", default_value = DEFAULT_CATALOG_URL)]
    pub catalog_url: String,

    /// Base URL of the firmware key pages
    #[arg(long, env = "IPCC_KEY_URL", default_value = DEFAULT_KEY_BASE_URL)]
    pub key_url: String,

    /// Maximum download attempts per archive
    #[arg(long, env = "IPCC_MAX_RETRIES", default_value_t = 5)]
    pub max_attempts: u32,

    /// Seconds between download attempts
    #[arg(long, env = "IPCC_RETRY_DELAY", default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "IPCC_REQUEST_TIMEOUT", default_value_t = 1000)]
    pub request_timeout_secs: u64,

    /// Treat a digest mismatch after download as an error
    #[arg(long, env = "IPCC_STRICT_HASH")]
    pub strict_hash: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "IPCC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl HarvestConfig {
    /// Parse configuration from command-line arguments.
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(HarvestError::InvalidConfig(
                "jobs must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(HarvestError::InvalidConfig(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.work_dir.exists() && !self.work_dir.is_dir() {
            return Err(HarvestError::InvalidConfig(format!(
                "work directory is not a directory: {}",
                self.work_dir.display()
            )));
        }
        Ok(())
    }

    /// HTTP transport settings
    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            proxy: self.http_proxy.clone().filter(|p| !p.is_empty()),
            ..HttpConfig::default()
        }
    }

    /// Download retry and verification settings
    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            strict_hash: self.strict_hash,
            ..DownloadConfig::default()
        }
    }

    /// Orchestrator settings
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            work_dir: self.work_dir.clone(),
            jobs: self.jobs,
            firmware_skip: self.firmware_skip,
            firmware: self.firmware.clone(),
            min_firmware: self.min_firmware,
            retry_ignored: self.retry_ignored,
        }
    }

    /// Device models selected by `product` and `product_skip`
    pub fn products(&self) -> ProductSet {
        ProductSet::new(self.product_skip, self.product.as_deref())
    }
}

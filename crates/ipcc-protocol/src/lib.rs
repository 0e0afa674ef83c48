//! # ipcc-protocol
//!
//! Network side of firmware acquisition:
//!
//! - [`CatalogClient`] fetches the per-device firmware catalog
//! - [`ResumableDownloader`] fetches archives with range-based resumption,
//!   bounded retries and digest verification
//! - [`KeyLookup`] / [`WikiKeyLookup`] resolve legacy image keys
//!
//! Configuration is passed in explicitly ([`HttpConfig`], [`DownloadConfig`]);
//! both can also be built from `IPCC_*` environment variables.
//!
//! ```rust,no_run
//! use ipcc_protocol::{CatalogClient, DownloadConfig, HttpClient, HttpConfig, ResumableDownloader};
//! use std::path::Path;
//!
//! # async fn run() -> ipcc_protocol::Result<()> {
//! let http = HttpClient::new(&HttpConfig::from_env()?)?;
//! let catalog = CatalogClient::new(http.clone(), ipcc_protocol::DEFAULT_CATALOG_URL)
//!     .device("iPhone9,1")
//!     .await?;
//!
//! let downloader = ResumableDownloader::new(http, DownloadConfig::from_env()?);
//! if let Some(record) = catalog.firmwares.first() {
//!     let archive = downloader.fetch(record, Path::new("iPhone9,1/15.8.3")).await?;
//!     println!("{}", archive.display());
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod keys;
pub mod transport;

pub use catalog::{CatalogClient, DEFAULT_CATALOG_URL, DeviceCatalog, FirmwareRecord};
pub use config::{DownloadConfig, HttpConfig};
pub use download::{DownloadState, ResumableDownloader};
pub use error::{ProtocolError, Result};
pub use keys::{DEFAULT_KEY_BASE_URL, KeyLookup, WikiKeyLookup};
pub use transport::HttpClient;

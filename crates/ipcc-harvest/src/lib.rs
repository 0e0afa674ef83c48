//! # ipcc-harvest
//!
//! Harvests carrier bundles from firmware archives. For every selected device
//! model the [`Pipeline`] fetches the firmware catalog and, per version:
//!
//! 1. downloads the archive ([`ipcc_protocol::ResumableDownloader`])
//! 2. extracts and, when needed, decrypts the system image ([`PayloadExtractor`])
//! 3. archives every carrier bundle as a hashed tar file ([`bundle`])
//! 4. records the result in the device's [`Ledger`]
//! 5. optionally publishes it ([`GitPublisher`])
//!
//! Versions that can never succeed are recorded as ignored and skipped on
//! later runs.
//!
//! ```rust,no_run
//! use ipcc_harvest::{HarvestConfig, IpswTool, PayloadExtractor, Pipeline, SevenZip};
//! use ipcc_protocol::{CatalogClient, HttpClient, ResumableDownloader, WikiKeyLookup};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarvestConfig::from_args();
//! let http = HttpClient::new(&config.http_config())?;
//!
//! let extractor = PayloadExtractor::new(
//!     Arc::new(SevenZip::default().locate()?),
//!     Arc::new(IpswTool::default()),
//!     Arc::new(WikiKeyLookup::new(http.clone(), config.key_url.clone())),
//! );
//! let pipeline = Pipeline::new(
//!     CatalogClient::new(http.clone(), config.catalog_url.clone()),
//!     ResumableDownloader::new(http, config.download_config()),
//!     extractor,
//!     config.pipeline_options(),
//! );
//!
//! for report in Arc::new(pipeline).run(config.products().models()).await {
//!     println!("{}: {} completed", report.identifier, report.completed);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod config;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod pipeline;
pub mod products;
pub mod publish;
pub mod tools;

pub use bundle::harvest_bundles;
pub use config::HarvestConfig;
pub use error::{Disposition, HarvestError, IgnoreReason, Result};
pub use extract::PayloadExtractor;
pub use ledger::{BundleArtifact, BundleManifest, CompletedFirmware, FirmwareMetadata, IgnoredFirmwares, Ledger};
pub use pipeline::{EntityReport, Pipeline, PipelineOptions, VersionOutcome};
pub use products::ProductSet;
pub use publish::{GitPublisher, Publisher};
pub use tools::{ArchiveTool, CommandOutput, ContainerDecryptor, IpswTool, SevenZip};

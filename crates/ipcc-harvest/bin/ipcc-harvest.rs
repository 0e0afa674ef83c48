//! ipcc-harvest binary entry point.
//!
//! Thin wrapper around the ipcc-harvest library that:
//! 1. Parses command-line arguments
//! 2. Initializes logging
//! 3. Wires the collaborators together
//! 4. Runs the pipeline and summarizes the results

use anyhow::{Context, Result};
use ipcc_harvest::{
    GitPublisher, HarvestConfig, IpswTool, PayloadExtractor, Pipeline, SevenZip,
};
use ipcc_protocol::{CatalogClient, HttpClient, ResumableDownloader, WikiKeyLookup};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = HarvestConfig::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    config.validate()?;

    let products = config.products();
    tracing::info!(
        "Configuration loaded: {} devices, {} jobs, work dir {:?}",
        products.len(),
        config.jobs,
        config.work_dir
    );

    let http = HttpClient::new(&config.http_config()).context("building HTTP client")?;

    let archive_tool = SevenZip::default()
        .locate()
        .context("7z is required to unpack disk images")?;
    let extractor = PayloadExtractor::new(
        Arc::new(archive_tool),
        Arc::new(IpswTool::default()),
        Arc::new(WikiKeyLookup::new(http.clone(), config.key_url.clone())),
    );

    let mut pipeline = Pipeline::new(
        CatalogClient::new(http.clone(), config.catalog_url.clone()),
        ResumableDownloader::new(http, config.download_config()),
        extractor,
        config.pipeline_options(),
    );

    if config.upload_github {
        let publisher = GitPublisher::new(&config.work_dir);
        publisher
            .prepare()
            .await
            .context("switching to the publishing branch")?;
        pipeline = pipeline.with_publisher(Arc::new(publisher));
    }

    let reports = Arc::new(pipeline).run(products.models()).await;

    let (mut completed, mut ignored, mut failed) = (0, 0, 0);
    for report in &reports {
        completed += report.completed;
        ignored += report.ignored;
        failed += report.failed;
    }
    tracing::info!(
        devices = reports.len(),
        completed,
        ignored,
        failed,
        "Harvest finished"
    );

    Ok(())
}

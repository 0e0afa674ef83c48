//! Pipeline orchestration
//!
//! Each device model becomes one task. Tasks run concurrently up to the
//! configured number of jobs; a task walks its device's firmwares one after
//! another in catalog order. A failing version never stops its siblings.

use ipcc_crypto::HashVerifier;
use ipcc_protocol::{CatalogClient, FirmwareRecord, ResumableDownloader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bundle::harvest_bundles;
use crate::error::{Disposition, Result};
use crate::extract::PayloadExtractor;
use crate::ledger::Ledger;
use crate::publish::Publisher;

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Directory holding one subdirectory per device
    pub work_dir: PathBuf,
    /// Devices processed concurrently
    pub jobs: usize,
    /// Oldest firmwares dropped from every catalog
    pub firmware_skip: usize,
    /// Only this version
    pub firmware: Option<String>,
    /// Minimum major version
    pub min_firmware: Option<u32>,
    /// Give ignored versions one more attempt
    pub retry_ignored: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            jobs: 3,
            firmware_skip: 0,
            firmware: None,
            min_firmware: None,
            retry_ignored: false,
        }
    }
}

impl PipelineOptions {
    /// Whether `record` passes the version filters
    pub fn wants(&self, record: &FirmwareRecord) -> bool {
        if let Some(firmware) = &self.firmware
            && &record.version != firmware
        {
            return false;
        }
        if let Some(min) = self.min_firmware
            && record.major_version().is_some_and(|major| major < min)
        {
            return false;
        }
        true
    }
}

/// Result of one version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOutcome {
    Completed,
    Skipped,
    Ignored,
    Failed,
}

/// Per-device summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityReport {
    pub identifier: String,
    pub completed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl EntityReport {
    fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    fn tally(&mut self, outcome: VersionOutcome) {
        match outcome {
            VersionOutcome::Completed => self.completed += 1,
            VersionOutcome::Skipped => self.skipped += 1,
            VersionOutcome::Ignored => self.ignored += 1,
            VersionOutcome::Failed => self.failed += 1,
        }
    }
}

enum Admission {
    Fresh,
    Retry,
    Skip,
}

/// Drives every device through download, extraction and harvesting
pub struct Pipeline {
    catalog: CatalogClient,
    downloader: ResumableDownloader,
    extractor: PayloadExtractor,
    publisher: Option<Arc<dyn Publisher>>,
    verifier: HashVerifier,
    options: PipelineOptions,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("options", &self.options)
            .field("publish", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        catalog: CatalogClient,
        downloader: ResumableDownloader,
        extractor: PayloadExtractor,
        options: PipelineOptions,
    ) -> Self {
        Self {
            catalog,
            downloader,
            extractor,
            publisher: None,
            verifier: HashVerifier::default(),
            options,
        }
    }

    /// Publish completed and ignored versions through `publisher`
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Process every model, at most `jobs` at a time
    pub async fn run(self: Arc<Self>, models: Vec<String>) -> Vec<EntityReport> {
        let permits = Arc::new(Semaphore::new(self.options.jobs.max(1)));
        let mut tasks = JoinSet::new();

        for model in models {
            let pipeline = Arc::clone(&self);
            let permits = Arc::clone(&permits);
            let span = info_span!("device", model = %model);

            tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let result = pipeline.process_model(&model).await;
                    (model, result)
                }
                .instrument(span),
            );
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((model, Err(e))) => error!(model = %model, "Device failed: {}", e),
                Err(e) => error!("Device task failed: {}", e),
            }
        }

        reports.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        reports
    }

    /// Fetch the catalog of `model` and process its firmwares in order
    pub async fn process_model(&self, model: &str) -> Result<EntityReport> {
        let mut catalog = self.catalog.device(model).await?;
        catalog.drop_oldest(self.options.firmware_skip);

        let Some(identifier) = catalog.firmwares.first().map(|f| f.identifier.clone()) else {
            info!("No firmwares listed for {}", model);
            return Ok(EntityReport::new(model));
        };

        let ledger = Ledger::new(self.options.work_dir.join(&identifier));
        tokio::fs::create_dir_all(ledger.dir()).await?;

        let mut report = EntityReport::new(&identifier);
        for record in catalog.firmwares.iter().filter(|r| self.options.wants(r)) {
            let outcome = self
                .process_version(&ledger, record)
                .instrument(info_span!("firmware", version = %record.version))
                .await;
            report.tally(outcome);
        }

        if matches!(with_ledger(&ledger, Ledger::is_empty).await, Ok(true)) {
            debug!("Nothing recorded for {}, removing {}", identifier, ledger.dir().display());
            remove_dir_logged(ledger.dir()).await;
        }

        info!(
            completed = report.completed,
            skipped = report.skipped,
            ignored = report.ignored,
            failed = report.failed,
            "Finished {}",
            identifier
        );
        Ok(report)
    }

    /// Take one version through the whole pipeline
    pub async fn process_version(&self, ledger: &Ledger, record: &FirmwareRecord) -> VersionOutcome {
        let version = record.version.as_str();
        let version_dir = ledger.version_dir(version);

        let retrying = match self.admit(ledger, version).await {
            Ok(Admission::Skip) => return VersionOutcome::Skipped,
            Ok(Admission::Retry) => true,
            Ok(Admission::Fresh) => false,
            Err(e) => {
                error!(identifier = %record.identifier, version, "Ledger unreadable: {}", e);
                return VersionOutcome::Failed;
            }
        };

        info!("Processing {} {} ({})", record.identifier, version, record.buildid);
        let started = Instant::now();

        match self.harvest(ledger, record, &version_dir, started).await {
            Ok(bundles) => {
                info!(
                    bundles,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Completed {} {}",
                    record.identifier,
                    version
                );
                if let Some(publisher) = &self.publisher
                    && let Err(e) = publisher.publish_completed(&record.identifier, version).await
                {
                    error!(identifier = %record.identifier, version, "Publish failed: {}", e);
                }
                VersionOutcome::Completed
            }
            Err(e) => {
                remove_dir_logged(&version_dir).await;

                match e.disposition() {
                    Disposition::Ignore(reason) => {
                        warn!(identifier = %record.identifier, version, %reason, "Ignoring firmware: {}", e);
                        self.ignore(ledger, record, retrying).await;
                        VersionOutcome::Ignored
                    }
                    Disposition::Transient => {
                        warn!(identifier = %record.identifier, version, "Firmware not finished, will retry next run: {}", e);
                        VersionOutcome::Failed
                    }
                    Disposition::Fatal => {
                        error!(identifier = %record.identifier, version, "Firmware failed: {}", e);
                        VersionOutcome::Failed
                    }
                }
            }
        }
    }

    async fn admit(&self, ledger: &Ledger, version: &str) -> Result<Admission> {
        let owned = version.to_string();
        let (ignored, completed) = with_ledger(ledger, move |l| {
            Ok((l.is_ignored(&owned)?, l.is_completed(&owned)?))
        })
        .await?;

        if ignored {
            if !self.options.retry_ignored {
                debug!("Skipping ignored {}", version);
                remove_dir_logged(&ledger.version_dir(version)).await;
                return Ok(Admission::Skip);
            }
            let owned = version.to_string();
            with_ledger(ledger, move |l| l.unignore(&owned)).await?;
            info!("Retrying previously ignored {}", version);
            return Ok(Admission::Retry);
        }

        if completed {
            debug!("Already completed {}", version);
            return Ok(Admission::Skip);
        }

        Ok(Admission::Fresh)
    }

    async fn harvest(
        &self,
        ledger: &Ledger,
        record: &FirmwareRecord,
        version_dir: &Path,
        started: Instant,
    ) -> Result<usize> {
        clear_stale_state(version_dir, &record.archive_file_name()).await?;

        let archive = self.downloader.fetch(record, version_dir).await?;
        let nested = self.extractor.extract(&archive, version_dir, record).await?;

        let artifacts = {
            let dir = version_dir.to_path_buf();
            let verifier = self.verifier;
            tokio::task::spawn_blocking(move || harvest_bundles(&dir, nested, &verifier)).await??
        };

        let bundles = artifacts.len();
        let version = record.version.clone();
        let buildid = record.buildid.clone();
        let elapsed = started.elapsed().as_secs_f64();
        with_ledger(ledger, move |l| {
            l.append_bundles(&l.bundles_path(&version), &artifacts)?;
            l.record_completed(&version, &buildid, elapsed)
        })
        .await?;
        Ok(bundles)
    }

    async fn ignore(&self, ledger: &Ledger, record: &FirmwareRecord, retrying: bool) {
        let version = record.version.clone();
        if let Err(e) = with_ledger(ledger, move |l| l.record_ignored(&version)).await {
            error!(identifier = %record.identifier, version = %record.version, "Failed to record ignored firmware: {}", e);
            return;
        }

        if retrying {
            return;
        }
        if let Some(publisher) = &self.publisher
            && let Err(e) = publisher
                .publish_ignored(&record.identifier, &record.version, &ledger.ignored_path())
                .await
        {
            error!(identifier = %record.identifier, version = %record.version, "Publish failed: {}", e);
        }
    }
}

/// Remove everything an interrupted attempt left behind except the partial archive
async fn clear_stale_state(version_dir: &Path, keep: &str) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(version_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == keep {
            continue;
        }
        let path = entry.path();
        debug!("Removing stale {}", path.display());
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

/// Run a ledger read or write on the blocking pool
async fn with_ledger<T, F>(ledger: &Ledger, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Ledger) -> Result<T> + Send + 'static,
{
    let ledger = ledger.clone();
    tokio::task::spawn_blocking(move || op(&ledger)).await?
}

async fn remove_dir_logged(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(version: &str) -> FirmwareRecord {
        FirmwareRecord {
            identifier: "iPhone9,1".to_string(),
            version: version.to_string(),
            buildid: "X".to_string(),
            sha1sum: String::new(),
            md5sum: String::new(),
            filesize: 0,
            url: String::new(),
            releasedate: None,
            uploaddate: None,
            signed: false,
        }
    }

    #[test]
    fn test_version_filters() {
        let all = PipelineOptions::default();
        assert!(all.wants(&record("10.0")));

        let exact = PipelineOptions {
            firmware: Some("15.8.3".to_string()),
            ..PipelineOptions::default()
        };
        assert!(exact.wants(&record("15.8.3")));
        assert!(!exact.wants(&record("15.8.2")));

        let min = PipelineOptions {
            min_firmware: Some(13),
            ..PipelineOptions::default()
        };
        assert!(min.wants(&record("13.0")));
        assert!(min.wants(&record("16.7.2")));
        assert!(!min.wants(&record("12.5.7")));
    }

    #[test]
    fn test_report_tally() {
        let mut report = EntityReport::new("iPhone9,1");
        report.tally(VersionOutcome::Completed);
        report.tally(VersionOutcome::Completed);
        report.tally(VersionOutcome::Ignored);
        report.tally(VersionOutcome::Failed);

        assert_eq!(report.completed, 2);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_clear_stale_state_keeps_archive() {
        let dir = TempDir::new().unwrap();
        let version_dir = dir.path().join("15.0");
        std::fs::create_dir_all(version_dir.join("System/Library")).unwrap();
        std::fs::write(version_dir.join("fw.ipsw"), b"partial").unwrap();
        std::fs::write(version_dir.join("090-1.dmg"), b"image").unwrap();
        std::fs::write(version_dir.join("bundles.json"), b"{}").unwrap();

        clear_stale_state(&version_dir, "fw.ipsw").await.unwrap();

        let left: Vec<_> = std::fs::read_dir(&version_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("fw.ipsw")]);

        // Missing directory is fine
        clear_stale_state(&dir.path().join("nope"), "fw.ipsw").await.unwrap();
    }

    #[tokio::test]
    async fn test_ledger_io_runs_off_the_async_thread() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::new(dir.path().join("iPhone9,1"));
        let caller = std::thread::current().id();

        let worker = with_ledger(&ledger, |l| {
            l.record_ignored("15.0")?;
            Ok(std::thread::current().id())
        })
        .await
        .expect("Operation should succeed");

        assert_ne!(worker, caller);
        assert!(ledger.is_ignored("15.0").unwrap());
        assert!(!with_ledger(&ledger, Ledger::is_empty).await.unwrap());
    }
}

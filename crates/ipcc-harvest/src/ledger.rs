//! Per-entity idempotency ledger
//!
//! Each device directory carries three kinds of JSON document:
//!
//! - `metadata.json` lists completed versions
//! - `ignored_firmwares.json` lists versions that will never succeed
//! - `<version>/bundles.json` lists the archived bundles of one version
//!
//! Every mutation loads the whole document, changes it and writes it back
//! through a temporary file followed by a rename, so a crash never leaves a
//! half-written document behind. A missing or empty document reads as empty.
//! Only the task that owns an entity writes its ledger.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{HarvestError, Result};

/// Completed-versions document file name
pub const METADATA_FILE: &str = "metadata.json";
/// Ignored-versions document file name
pub const IGNORED_FILE: &str = "ignored_firmwares.json";
/// Per-version bundle manifest file name
pub const BUNDLES_FILE: &str = "bundles.json";

/// One fully processed firmware version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedFirmware {
    /// Firmware version string
    pub version: String,
    /// Build identifier
    pub buildid: String,
    /// When processing finished
    pub downloaded_at: DateTime<Utc>,
    /// Wall-clock processing time
    pub processing_time_sec: f64,
}

/// `metadata.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareMetadata {
    /// Completed versions in completion order
    #[serde(default)]
    pub fw: Vec<CompletedFirmware>,
    /// Last modification time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `ignored_firmwares.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredFirmwares {
    /// Ignored version strings
    #[serde(default)]
    pub ignored: Vec<String>,
    /// Last modification time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One archived and hashed bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleArtifact {
    /// Bundle name (file stem of the tar archive)
    pub bundle_name: String,
    /// SHA-1 of the tar archive, lowercase hex
    pub sha1: String,
    /// Size of the tar archive in bytes
    pub file_size: u64,
    /// When the archive was created
    pub created_at: DateTime<Utc>,
}

/// `<version>/bundles.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Archived bundles
    #[serde(default)]
    pub bundles: Vec<BundleArtifact>,
    /// Last modification time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

trait LedgerDocument: Serialize + DeserializeOwned + Default {
    fn touch(&mut self, now: DateTime<Utc>);
}

impl LedgerDocument for FirmwareMetadata {
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

impl LedgerDocument for IgnoredFirmwares {
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

impl LedgerDocument for BundleManifest {
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

fn load<D: LedgerDocument>(path: &Path) -> Result<D> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(D::default()),
        Err(e) => return Err(e.into()),
    };

    if text.trim().is_empty() {
        return Ok(D::default());
    }

    serde_json::from_str(&text).map_err(|e| HarvestError::json(path, e))
}

fn save<D: LedgerDocument>(path: &Path, doc: &mut D) -> Result<()> {
    doc.touch(Utc::now());
    let json = serde_json::to_vec_pretty(doc).map_err(|e| HarvestError::json(path, e))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write to temp file first, then rename
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, path)?;

    debug!("Saved ledger document {}", path.display());
    Ok(())
}

/// Ledger for one entity directory
#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
}

impl Ledger {
    /// Open the ledger rooted at `entity_dir`. Nothing is read until queried.
    pub fn new(entity_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: entity_dir.into(),
        }
    }

    /// Entity directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Working directory of one version
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.dir.join(version)
    }

    /// Path of `metadata.json`
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Path of `ignored_firmwares.json`
    pub fn ignored_path(&self) -> PathBuf {
        self.dir.join(IGNORED_FILE)
    }

    /// Path of a version's `bundles.json`
    pub fn bundles_path(&self, version: &str) -> PathBuf {
        self.version_dir(version).join(BUNDLES_FILE)
    }

    /// Completed-versions document
    pub fn metadata(&self) -> Result<FirmwareMetadata> {
        load(&self.metadata_path())
    }

    /// Ignored-versions document
    pub fn ignored(&self) -> Result<IgnoredFirmwares> {
        load(&self.ignored_path())
    }

    pub fn is_ignored(&self, version: &str) -> Result<bool> {
        Ok(self.ignored()?.ignored.iter().any(|v| v == version))
    }

    pub fn is_completed(&self, version: &str) -> Result<bool> {
        Ok(self.metadata()?.fw.iter().any(|fw| fw.version == version))
    }

    /// Record `version` as completed. Any ignored entry for it is dropped.
    pub fn record_completed(
        &self,
        version: &str,
        build_id: &str,
        elapsed_seconds: f64,
    ) -> Result<()> {
        self.remove_ignored(version)?;

        let path = self.metadata_path();
        let mut doc: FirmwareMetadata = load(&path)?;
        doc.fw.retain(|fw| fw.version != version);
        doc.fw.push(CompletedFirmware {
            version: version.to_string(),
            buildid: build_id.to_string(),
            downloaded_at: Utc::now(),
            processing_time_sec: elapsed_seconds,
        });
        save(&path, &mut doc)
    }

    /// Record `version` as ignored. Any completed entry for it is dropped.
    pub fn record_ignored(&self, version: &str) -> Result<()> {
        let meta_path = self.metadata_path();
        let mut meta: FirmwareMetadata = load(&meta_path)?;
        if meta.fw.iter().any(|fw| fw.version == version) {
            meta.fw.retain(|fw| fw.version != version);
            save(&meta_path, &mut meta)?;
        }

        let path = self.ignored_path();
        let mut doc: IgnoredFirmwares = load(&path)?;
        if !doc.ignored.iter().any(|v| v == version) {
            doc.ignored.push(version.to_string());
        }
        save(&path, &mut doc)
    }

    /// Remove `version` from the ignored list. Returns whether it was present.
    pub fn unignore(&self, version: &str) -> Result<bool> {
        self.remove_ignored(version)
    }

    fn remove_ignored(&self, version: &str) -> Result<bool> {
        let path = self.ignored_path();
        let mut doc: IgnoredFirmwares = load(&path)?;
        let before = doc.ignored.len();
        doc.ignored.retain(|v| v != version);
        if doc.ignored.len() == before {
            return Ok(false);
        }
        save(&path, &mut doc)?;
        Ok(true)
    }

    /// Append artifacts to the manifest at `manifest_path`
    pub fn append_bundles(&self, manifest_path: &Path, artifacts: &[BundleArtifact]) -> Result<()> {
        let mut doc: BundleManifest = load(manifest_path)?;
        doc.bundles.extend_from_slice(artifacts);
        save(manifest_path, &mut doc)
    }

    /// Bundle manifest of one version
    pub fn bundles(&self, version: &str) -> Result<BundleManifest> {
        load(&self.bundles_path(version))
    }

    /// Neither completed nor ignored versions are recorded
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.metadata()?.fw.is_empty() && self.ignored()?.ignored.is_empty())
    }
}

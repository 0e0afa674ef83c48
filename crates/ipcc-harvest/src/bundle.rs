//! Carrier bundle harvesting
//!
//! After the image's `System/Library/Carrier Bundles` tree has been unpacked
//! into a version directory, every `*.bundle` directory is moved to the top of
//! that directory, the rest of the unpacked tree is removed, and each bundle
//! is archived to `<name>.tar` and hashed.
//!
//! All functions here are blocking and are run on the blocking pool.

use chrono::Utc;
use ipcc_crypto::{HashAlgorithm, HashVerifier};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{HarvestError, Result};
use crate::ledger::BundleArtifact;

/// Carrier bundle directory inside a system tree
pub const CARRIER_BUNDLES_DIR: &str = "System/Library/Carrier Bundles";

/// Pattern handed to the archive tool
pub fn unpack_pattern(nested: bool) -> String {
    if nested {
        format!("*/{CARRIER_BUNDLES_DIR}/*")
    } else {
        format!("{CARRIER_BUNDLES_DIR}/*")
    }
}

fn io_error(e: walkdir::Error) -> HarvestError {
    HarvestError::Io(e.into())
}

/// Carrier bundle roots below `version_dir`
fn bundle_roots(version_dir: &Path, nested: bool) -> Result<Vec<PathBuf>> {
    if !nested {
        return Ok(vec![version_dir.join(CARRIER_BUNDLES_DIR)]);
    }

    let mut roots = Vec::new();
    for entry in std::fs::read_dir(version_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            roots.push(entry.path().join(CARRIER_BUNDLES_DIR));
        }
    }
    roots.sort();
    Ok(roots)
}

/// Every `*.bundle` directory below the carrier bundle roots
pub fn find_bundles(version_dir: &Path, nested: bool) -> Result<Vec<PathBuf>> {
    let mut bundles = Vec::new();

    for root in bundle_roots(version_dir, nested)? {
        if !root.is_dir() {
            continue;
        }

        let mut walker = WalkDir::new(&root).min_depth(1).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(io_error)?;
            let is_bundle = entry.file_type().is_dir()
                && entry.path().extension().is_some_and(|ext| ext == "bundle");
            if is_bundle {
                bundles.push(entry.into_path());
                walker.skip_current_dir();
            }
        }
    }

    Ok(bundles)
}

/// Move bundles into `version_dir` and drop the rest of the unpacked tree
pub fn collect_bundles(version_dir: &Path, nested: bool) -> Result<Vec<PathBuf>> {
    let mut moved = Vec::new();

    for bundle in find_bundles(version_dir, nested)? {
        let Some(name) = bundle.file_name() else {
            continue;
        };
        let target = version_dir.join(name);
        if target.exists() {
            debug!("Replacing duplicate bundle {}", target.display());
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&bundle, &target)?;
        moved.push(target);
    }

    remove_system_tree(version_dir, nested)?;
    Ok(moved)
}

fn remove_system_tree(version_dir: &Path, nested: bool) -> Result<()> {
    if !nested {
        let system = version_dir.join("System");
        if system.exists() {
            std::fs::remove_dir_all(system)?;
        }
        return Ok(());
    }

    let mut parents = Vec::new();
    for entry in std::fs::read_dir(version_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.path().join("System").is_dir() {
            parents.push(entry.path());
        }
    }
    parents.sort();

    let parent = parents.first().ok_or(HarvestError::NestedSystemMissing)?;
    std::fs::remove_dir_all(parent)?;
    Ok(())
}

/// Archive one bundle directory to `<bundle>.tar` next to it
pub fn tar_bundle(bundle: &Path) -> Result<PathBuf> {
    let name = bundle
        .file_name()
        .ok_or_else(|| std::io::Error::other(format!("not a bundle: {}", bundle.display())))?;
    let tar_path = bundle.with_extension("tar");

    let mut builder = tar::Builder::new(File::create(&tar_path)?);
    builder.append_dir_all(name, bundle)?;
    builder.into_inner()?.sync_all()?;

    Ok(tar_path)
}

/// Archive and hash every bundle, removing the source directories
pub fn archive_bundles(bundles: &[PathBuf], verifier: &HashVerifier) -> Result<Vec<BundleArtifact>> {
    let mut artifacts = Vec::with_capacity(bundles.len());

    for bundle in bundles {
        let tar_path = tar_bundle(bundle)?;
        let sha1 = verifier.digest(&tar_path, HashAlgorithm::Sha1)?;
        let file_size = std::fs::metadata(&tar_path)?.len();
        let bundle_name = tar_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!("Archived {} ({} bytes, sha1 {})", bundle_name, file_size, sha1);
        artifacts.push(BundleArtifact {
            bundle_name,
            sha1,
            file_size,
            created_at: Utc::now(),
        });
    }

    for bundle in bundles {
        std::fs::remove_dir_all(bundle)?;
    }

    Ok(artifacts)
}

/// Full harvesting step for one unpacked version directory
pub fn harvest_bundles(
    version_dir: &Path,
    nested: bool,
    verifier: &HashVerifier,
) -> Result<Vec<BundleArtifact>> {
    let bundles = collect_bundles(version_dir, nested)?;
    let artifacts = archive_bundles(&bundles, verifier)?;
    info!(
        "Harvested {} carrier bundles in {}",
        artifacts.len(),
        version_dir.display()
    );
    Ok(artifacts)
}

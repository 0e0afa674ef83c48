//! Disk image extraction from firmware archives
//!
//! One archive goes through these steps:
//!
//! 1. locate the largest `.dmg` or `.dmg.aea` member
//! 2. write it next to the archive unless an equally sized copy is already there
//! 3. unwrap container-encrypted images through a [`ContainerDecryptor`]
//! 4. unpack the carrier bundle tree with an [`ArchiveTool`]
//! 5. if the tool cannot open the image, decrypt it with a looked-up legacy
//!    key and unpack once more
//!
//! The extracted image and the archive are deleted when extraction finishes,
//! whatever the outcome.

use ipcc_crypto::decrypt_image;
use ipcc_protocol::{FirmwareRecord, KeyLookup};
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::bundle::unpack_pattern;
use crate::error::{HarvestError, Result};
use crate::tools::{ArchiveTool, ContainerDecryptor};

/// Plain disk image suffix
pub const IMAGE_SUFFIX: &str = ".dmg";
/// Container-encrypted disk image suffix
pub const ENCRYPTED_IMAGE_SUFFIX: &str = ".dmg.aea";
/// Archive tool error for images encrypted with a legacy key
pub const LEGACY_ENCRYPTION_MARKER: &str = "Cannot open the file as [Dmg] archive";

const BUILD_MANIFEST: &str = "BuildManifest.plist";

static BUILD_TRAIN_RE: LazyLock<std::result::Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"<key>\s*BuildTrain\s*</key>\s*<string>\s*([^<\s]+)\s*</string>")
});

/// Selected image member of an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Member name inside the archive
    pub name: String,
    /// Uncompressed size
    pub size: u64,
}

impl ImageEntry {
    pub fn is_container_encrypted(&self) -> bool {
        self.name.ends_with(ENCRYPTED_IMAGE_SUFFIX)
    }

    /// Final path component, so members never escape the output directory
    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.name).file_name().and_then(|n| n.to_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnpackStage {
    Direct,
    AfterLegacyDecrypt,
}

/// Deletes tracked files when dropped
#[derive(Debug, Default)]
struct CleanupGuard {
    paths: Vec<PathBuf>,
}

impl CleanupGuard {
    fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Pulls the carrier bundle tree out of a firmware archive
#[derive(Clone)]
pub struct PayloadExtractor {
    archive_tool: Arc<dyn ArchiveTool>,
    container: Arc<dyn ContainerDecryptor>,
    keys: Arc<dyn KeyLookup>,
}

impl std::fmt::Debug for PayloadExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadExtractor").finish_non_exhaustive()
    }
}

impl PayloadExtractor {
    pub fn new(
        archive_tool: Arc<dyn ArchiveTool>,
        container: Arc<dyn ContainerDecryptor>,
        keys: Arc<dyn KeyLookup>,
    ) -> Self {
        Self {
            archive_tool,
            container,
            keys,
        }
    }

    /// Unpack the carrier bundle tree of `archive` into `out_dir`.
    ///
    /// Returns whether the tree sat one directory deeper than usual. The
    /// archive and the intermediate image are gone afterwards.
    pub async fn extract(
        &self,
        archive: &Path,
        out_dir: &Path,
        record: &FirmwareRecord,
    ) -> Result<bool> {
        let mut cleanup = CleanupGuard::default();
        cleanup.track(archive);

        let entry = {
            let archive = archive.to_path_buf();
            tokio::task::spawn_blocking(move || locate_image(&archive)).await??
        };
        let file_name = entry.file_name().ok_or_else(|| HarvestError::NoImagePayload {
            archive: archive.to_path_buf(),
        })?;
        let mut image = out_dir.join(file_name);
        cleanup.track(&image);

        {
            let (archive, image, entry) = (archive.to_path_buf(), image.clone(), entry.clone());
            tokio::task::spawn_blocking(move || materialize_image(&archive, &entry, &image))
                .await??;
        }

        if entry.is_container_encrypted() {
            info!("Unwrapping container-encrypted image {}", entry.name);
            image = self.container.unwrap_image(archive, &image, out_dir).await?;
            cleanup.track(&image);
        }

        let mut stage = UnpackStage::Direct;
        loop {
            let nested = self.archive_tool.payload_is_nested(&image).await?;
            let output = self
                .archive_tool
                .extract(&image, out_dir, &unpack_pattern(nested))
                .await?;

            if output.success() {
                debug!("Unpacked {} (nested: {})", image.display(), nested);
                return Ok(nested);
            }

            match stage {
                UnpackStage::Direct if output.stderr.contains(LEGACY_ENCRYPTION_MARKER) => {
                    info!("Image {} needs legacy decryption", image.display());
                    cleanup.track(decrypt_temp_path(&image));
                    self.decrypt_legacy(archive, &image, record).await?;
                    stage = UnpackStage::AfterLegacyDecrypt;
                }
                _ => {
                    return Err(HarvestError::ToolFailed {
                        tool: "7z".to_string(),
                        code: output.code,
                        stderr: output.stderr.trim().to_string(),
                    });
                }
            }
        }
    }

    async fn decrypt_legacy(
        &self,
        archive: &Path,
        image: &Path,
        record: &FirmwareRecord,
    ) -> Result<()> {
        let build_train = {
            let archive = archive.to_path_buf();
            tokio::task::spawn_blocking(move || read_build_train(&archive)).await??
        };

        let key = self
            .keys
            .lookup(&build_train, &record.buildid, &record.identifier)
            .await?;

        let image = image.to_path_buf();
        tokio::task::spawn_blocking(move || decrypt_in_place(&image, &key)).await?
    }
}

/// Largest image member of the archive
pub fn locate_image(archive: &Path) -> Result<ImageEntry> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;

    let mut best: Option<ImageEntry> = None;
    for i in 0..zip.len() {
        let file = zip.by_index(i)?;
        let name = file.name();
        if !(name.ends_with(IMAGE_SUFFIX) || name.ends_with(ENCRYPTED_IMAGE_SUFFIX)) {
            continue;
        }
        if best.as_ref().is_none_or(|b| file.size() > b.size) {
            best = Some(ImageEntry {
                name: name.to_string(),
                size: file.size(),
            });
        }
    }

    let entry = best.ok_or_else(|| HarvestError::NoImagePayload {
        archive: archive.to_path_buf(),
    })?;
    debug!("Selected image {} ({} bytes)", entry.name, entry.size);
    Ok(entry)
}

/// Write `entry` to `dest` unless an equally sized file is already there
pub fn materialize_image(archive: &Path, entry: &ImageEntry, dest: &Path) -> Result<()> {
    if let Ok(meta) = std::fs::metadata(dest)
        && meta.len() == entry.size
    {
        debug!("Image {} already extracted", dest.display());
        return Ok(());
    }

    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    let mut member = zip.by_name(&entry.name)?;
    let mut out = File::create(dest)?;
    let written = std::io::copy(&mut member, &mut out)?;
    out.sync_all()?;

    info!("Extracted {} ({} bytes)", entry.name, written);
    Ok(())
}

/// `BuildTrain` value of the archive's build manifest
pub fn read_build_train(archive: &Path) -> Result<String> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    let mut manifest = zip.by_name(BUILD_MANIFEST)?;
    let mut text = String::new();
    manifest.read_to_string(&mut text)?;
    parse_build_train(&text).ok_or(HarvestError::BuildTrainMissing)
}

/// Extract `BuildTrain` from an XML property list
pub fn parse_build_train(plist: &str) -> Option<String> {
    let re = BUILD_TRAIN_RE.as_ref().ok()?;
    re.captures(plist)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn decrypt_temp_path(image: &Path) -> PathBuf {
    let mut temp = image.as_os_str().to_owned();
    temp.push(".temp");
    PathBuf::from(temp)
}

/// Decrypt `image` through `<image>.temp` and replace it
fn decrypt_in_place(image: &Path, key_hex: &str) -> Result<()> {
    let temp = decrypt_temp_path(image);

    match decrypt_image(image, &temp, key_hex) {
        Ok(summary) => {
            debug!(
                "Decrypted {} image: {} chunks, {} bytes",
                summary.version, summary.chunks, summary.bytes_written
            );
            std::fs::rename(&temp, image)?;
            Ok(())
        }
        Err(e) => {
            match std::fs::remove_file(&temp) {
                Ok(()) => debug!("Removed {}", temp.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove {}: {}", temp.display(), err),
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, members: &[(&str, Vec<u8>)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in members {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_locate_picks_largest_image() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("fw.ipsw");
        write_zip(
            &archive,
            &[
                ("BuildManifest.plist", vec![0; 10]),
                ("kernelcache.release", vec![0; 5000]),
                ("090-1.dmg", vec![0; 100]),
                ("090-2.dmg.aea", vec![0; 300]),
                ("090-3.dmg", vec![0; 200]),
            ],
        );

        let entry = locate_image(&archive).expect("Operation should succeed");
        assert_eq!(entry.name, "090-2.dmg.aea");
        assert_eq!(entry.size, 300);
        assert!(entry.is_container_encrypted());
    }

    #[test]
    fn test_locate_without_image() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("fw.ipsw");
        write_zip(&archive, &[("kernelcache.release", vec![0; 50])]);

        let result = locate_image(&archive);
        assert!(matches!(result, Err(HarvestError::NoImagePayload { .. })));
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("fw.ipsw");
        write_zip(&archive, &[("090-1.dmg", vec![7; 1000])]);
        let entry = locate_image(&archive).unwrap();
        let dest = dir.path().join("090-1.dmg");

        materialize_image(&archive, &entry, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7; 1000]);

        // Same size: left alone
        std::fs::write(&dest, vec![1; 1000]).unwrap();
        materialize_image(&archive, &entry, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), vec![1; 1000]);

        // Wrong size: extracted again
        std::fs::write(&dest, vec![1; 10]).unwrap();
        materialize_image(&archive, &entry, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7; 1000]);
    }

    #[test]
    fn test_parse_build_train() {
        let plist = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
	<key>BuildIdentities</key>
	<array/>
	<key>BuildTrain</key>
	<string>Sunburst</string>
	<key>ProductBuildVersion</key>
	<string>13A452</string>
</dict>
</plist>"#;
        assert_eq!(parse_build_train(plist).as_deref(), Some("Sunburst"));
        assert_eq!(parse_build_train("<plist><dict/></plist>"), None);
    }

    #[test]
    fn test_read_build_train_missing() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("fw.ipsw");
        write_zip(&archive, &[("BuildManifest.plist", b"<plist/>".to_vec())]);

        assert!(matches!(
            read_build_train(&archive),
            Err(HarvestError::BuildTrainMissing)
        ));
    }

    #[test]
    fn test_cleanup_guard() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, b"x").unwrap();
        {
            let mut guard = CleanupGuard::default();
            guard.track(&a);
            guard.track(dir.path().join("missing"));
        }
        assert!(!a.exists());
    }

    #[test]
    fn test_failed_decrypt_leaves_image_and_no_temp() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("090-1.dmg");
        std::fs::write(&image, vec![3u8; 256]).unwrap();
        let temp = decrypt_temp_path(&image);
        std::fs::write(&temp, b"stale").unwrap();

        let result = decrypt_in_place(&image, &"ab".repeat(36));

        assert!(matches!(result, Err(HarvestError::Crypto(_))));
        assert!(!temp.exists());
        assert_eq!(std::fs::read(&image).unwrap(), vec![3u8; 256]);
    }

    #[test]
    fn test_image_entry_file_name() {
        let entry = ImageEntry {
            name: "../../etc/090-1.dmg".to_string(),
            size: 1,
        };
        assert_eq!(entry.file_name(), Some("090-1.dmg"));
    }
}

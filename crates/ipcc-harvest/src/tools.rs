//! External tool collaborators
//!
//! Unpacking disk images and unwrapping container-encrypted images is done by
//! external programs. Each is reached through a trait so the pipeline can be
//! exercised with in-process fakes.

use async_trait::async_trait;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{HarvestError, Result};

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn into_error(self, tool: &str) -> HarvestError {
        HarvestError::ToolFailed {
            tool: tool.to_string(),
            code: self.code,
            stderr: self.stderr.trim().to_string(),
        }
    }
}

/// Run `program` to completion and capture its output
pub async fn run_command<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = command.output().await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => HarvestError::ToolUnavailable(program.to_string()),
        _ => HarvestError::Io(e),
    })?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code(),
    })
}

/// Like [`run_command`], but a non-zero exit is an error
pub async fn run_checked<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_command(program, args, cwd).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(output.into_error(program))
    }
}

/// Lists and unpacks disk images
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// Whether the image's `System` tree sits one directory deeper than usual
    async fn payload_is_nested(&self, image: &Path) -> Result<bool>;

    /// Extract members matching `pattern` into `dest`.
    ///
    /// A non-zero exit is reported through [`CommandOutput`], not as an error.
    async fn extract(&self, image: &Path, dest: &Path, pattern: &str) -> Result<CommandOutput>;
}

/// Listing lines past the header before an image counts as nested
pub const NESTED_LISTING_THRESHOLD: usize = 10;

/// Counts distinct listing lines after the `Date`/`Time` header
#[derive(Debug, Default)]
pub struct ListingProbe {
    started: bool,
    seen: HashSet<String>,
}

impl ListingProbe {
    /// Feed one line. Returns `true` once enough lines were seen to stop reading.
    pub fn push(&mut self, line: &str) -> bool {
        if !self.started {
            if line.contains("Date") && line.contains("Time") {
                self.started = true;
            } else {
                return false;
            }
        }
        self.seen.insert(line.to_string());
        self.is_nested()
    }

    pub fn is_nested(&self) -> bool {
        self.seen.len() > NESTED_LISTING_THRESHOLD
    }
}

/// `7z` based [`ArchiveTool`]
#[derive(Debug, Clone)]
pub struct SevenZip {
    program: String,
}

impl Default for SevenZip {
    fn default() -> Self {
        Self {
            program: "7z".to_string(),
        }
    }
}

impl SevenZip {
    /// Use `program` instead of `7z`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Fail early when the program is not on `PATH`
    pub fn locate(self) -> Result<Self> {
        which::which(&self.program).map_err(|_| HarvestError::ToolUnavailable(self.program.clone()))?;
        Ok(self)
    }
}

#[async_trait]
impl ArchiveTool for SevenZip {
    async fn payload_is_nested(&self, image: &Path) -> Result<bool> {
        let mut child = Command::new(&self.program)
            .arg("l")
            .arg(image)
            .arg("*/System")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => HarvestError::ToolUnavailable(self.program.clone()),
                _ => HarvestError::Io(e),
            })?;

        let mut probe = ListingProbe::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if probe.push(&line) {
                    break;
                }
            }
        }

        // The listing of a large image keeps going long after we have our answer
        if let Err(e) = child.start_kill() {
            debug!("7z listing already exited: {}", e);
        }
        if let Err(e) = child.wait().await {
            debug!("Failed to reap 7z listing: {}", e);
        }

        debug!(
            "Nested payload probe for {}: {}",
            image.display(),
            probe.is_nested()
        );
        Ok(probe.is_nested())
    }

    async fn extract(&self, image: &Path, dest: &Path, pattern: &str) -> Result<CommandOutput> {
        let mut out_flag = OsString::from("-o");
        out_flag.push(dest);

        debug!("Extracting {} from {}", pattern, image.display());
        run_command(
            &self.program,
            [
                OsStr::new("x"),
                image.as_os_str(),
                out_flag.as_os_str(),
                OsStr::new("-aos"),
                OsStr::new("-bd"),
                OsStr::new("-y"),
                OsStr::new(pattern),
            ],
            None,
        )
        .await
    }
}

/// Unwraps container-encrypted (`.aea`) images
#[async_trait]
pub trait ContainerDecryptor: Send + Sync {
    /// Unwrap `image`, taken from `archive`, inside `work_dir` and return the plain image path
    async fn unwrap_image(&self, archive: &Path, image: &Path, work_dir: &Path) -> Result<PathBuf>;
}

/// Release package installed when `ipsw` is missing
pub const IPSW_PACKAGE_URL: &str =
    "https://github.com/blacktop/ipsw/releases/download/v3.1.544/ipsw_3.1.544_linux_x86_64.deb";

/// `ipsw` based [`ContainerDecryptor`]
#[derive(Debug, Clone)]
pub struct IpswTool {
    program: String,
    package_url: String,
    package_path: PathBuf,
}

impl Default for IpswTool {
    fn default() -> Self {
        Self {
            program: "ipsw".to_string(),
            package_url: IPSW_PACKAGE_URL.to_string(),
            package_path: PathBuf::from("ipsw.deb"),
        }
    }
}

impl IpswTool {
    /// Install the tool from its release package if it is not on `PATH`
    pub async fn ensure_installed(&self) -> Result<()> {
        if which::which(&self.program).is_ok() {
            return Ok(());
        }

        info!("{} not found, installing {}", self.program, self.package_url);
        if !self.package_path.exists() {
            run_checked(
                "wget",
                [
                    OsStr::new(&self.package_url),
                    OsStr::new("--output-document"),
                    self.package_path.as_os_str(),
                ],
                None,
            )
            .await?;
        }

        let installed = run_checked(
            "sudo",
            [OsStr::new("dpkg"), OsStr::new("-i"), self.package_path.as_os_str()],
            None,
        )
        .await;

        if let Err(e) = tokio::fs::remove_file(&self.package_path).await {
            warn!("Failed to remove {}: {}", self.package_path.display(), e);
        }

        installed.map_err(|e| {
            warn!("Installing {} failed: {}", self.program, e);
            HarvestError::ToolUnavailable(self.program.clone())
        })?;
        Ok(())
    }
}

#[async_trait]
impl ContainerDecryptor for IpswTool {
    async fn unwrap_image(&self, archive: &Path, image: &Path, work_dir: &Path) -> Result<PathBuf> {
        self.ensure_installed().await?;

        run_checked(
            &self.program,
            [
                OsStr::new("extract"),
                OsStr::new("--fcs-key"),
                archive.as_os_str(),
                OsStr::new("--output"),
                work_dir.as_os_str(),
            ],
            None,
        )
        .await?;

        let pems = find_pem_files(work_dir);
        let pem = select_pem(&pems, image).ok_or_else(|| HarvestError::ToolFailed {
            tool: self.program.clone(),
            code: None,
            stderr: "no .pem key file was produced".to_string(),
        })?;
        debug!("Using key file {}", pem.display());

        let unwrapped = run_checked(
            &self.program,
            [
                OsStr::new("fw"),
                OsStr::new("aea"),
                OsStr::new("--pem"),
                pem.as_os_str(),
                image.as_os_str(),
                OsStr::new("--output"),
                work_dir.as_os_str(),
            ],
            None,
        )
        .await;

        remove_key_material(pem, work_dir).await;
        unwrapped?;

        tokio::fs::remove_file(image).await?;
        Ok(strip_aea(image))
    }
}

/// Remove the key file's directory, or only the file when it sits directly in `work_dir`
async fn remove_key_material(pem: &Path, work_dir: &Path) {
    let removed = match pem.parent() {
        Some(key_dir) if key_dir != work_dir => tokio::fs::remove_dir_all(key_dir).await,
        _ => tokio::fs::remove_file(pem).await,
    };
    if let Err(e) = removed {
        warn!("Failed to remove key material {}: {}", pem.display(), e);
    }
}

fn find_pem_files(dir: &Path) -> Vec<PathBuf> {
    let mut pems: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|ext| ext == "pem"))
        .collect();
    pems.sort();
    pems
}

/// The key file named after the image, else the first one found
pub fn select_pem<'a>(pems: &'a [PathBuf], image: &Path) -> Option<&'a PathBuf> {
    let image_name = image.file_name();
    pems.iter()
        .find(|pem| pem.file_stem().is_some() && pem.file_stem() == image_name)
        .or_else(|| pems.first())
}

/// `x.dmg.aea` becomes `x.dmg`; other paths are returned unchanged
pub fn strip_aea(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "aea") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

//! Resumable, verified archive downloads
//!
//! Archives are written to a deterministic path inside the destination
//! directory. An existing file whose digest already matches is returned
//! without touching the network. Otherwise the transfer resumes from the
//! bytes already on disk using HTTP range requests, retrying interrupted
//! transfers a bounded number of times with a fixed delay.

use futures::StreamExt;
use ipcc_crypto::HashVerifier;
use reqwest::StatusCode;
use reqwest::header::CONTENT_RANGE;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

use crate::catalog::FirmwareRecord;
use crate::config::DownloadConfig;
use crate::error::{ProtocolError, Result};
use crate::transport::{HttpClient, classify};

/// Progress of one `fetch` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    /// Local archive path
    pub path: PathBuf,
    /// Bytes already on disk
    pub bytes_on_disk: u64,
    /// Remote object size, if known
    pub remote_size: Option<u64>,
    /// Attempts made so far
    pub attempt: u32,
}

impl DownloadState {
    fn new(path: PathBuf, remote_size: Option<u64>) -> Self {
        Self {
            path,
            bytes_on_disk: 0,
            remote_size,
            attempt: 0,
        }
    }

    /// The local file already holds every remote byte
    pub fn is_complete(&self) -> bool {
        matches!(self.remote_size, Some(total) if self.bytes_on_disk >= total)
    }

    async fn refresh(&mut self) {
        self.bytes_on_disk = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
    }
}

/// Downloads firmware archives with resume and verification
#[derive(Debug, Clone)]
pub struct ResumableDownloader {
    http: HttpClient,
    config: DownloadConfig,
    verifier: HashVerifier,
}

impl ResumableDownloader {
    /// Create a downloader
    pub fn new(http: HttpClient, config: DownloadConfig) -> Self {
        Self {
            http,
            config,
            verifier: HashVerifier::default(),
        }
    }

    /// Download `record` into `dest_dir`, returning the archive path
    pub async fn fetch(&self, record: &FirmwareRecord, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(record.archive_file_name());

        if tokio::fs::try_exists(&path).await? && self.verify(&path, record).await? {
            debug!("{} already downloaded and verified", path.display());
            return Ok(path);
        }

        let mut state = DownloadState::new(path, self.http.content_length(&record.url).await);
        state.refresh().await;

        // A full-size file that failed verification cannot be resumed
        if state.bytes_on_disk > 0 && state.is_complete() {
            warn!(
                "Discarding {} ({} bytes): digest mismatch",
                state.path.display(),
                state.bytes_on_disk
            );
            remove_partial(&state.path).await;
            state.bytes_on_disk = 0;
        }

        self.transfer(record, &mut state).await?;

        if !self.verify(&state.path, record).await? {
            if self.config.strict_hash {
                remove_partial(&state.path).await;
                return Err(ProtocolError::HashMismatch { path: state.path });
            }
            warn!(
                identifier = %record.identifier,
                version = %record.version,
                "Hash mismatch for {}",
                state.path.display()
            );
        }

        Ok(state.path)
    }

    async fn transfer(&self, record: &FirmwareRecord, state: &mut DownloadState) -> Result<()> {
        loop {
            if state.attempt >= self.config.max_attempts {
                remove_partial(&state.path).await;
                return Err(ProtocolError::RetriesExhausted {
                    attempts: state.attempt,
                });
            }

            state.refresh().await;
            if state.is_complete() {
                info!("{} already complete on disk", state.path.display());
                return Ok(());
            }

            state.attempt += 1;
            match self.attempt(record, state).await {
                Ok(()) => return Ok(()),
                Err(ProtocolError::RangeNotSatisfiable) => {
                    warn!(
                        attempt = state.attempt,
                        "Range not satisfiable for {}, restarting from zero",
                        state.path.display()
                    );
                    remove_partial(&state.path).await;
                }
                Err(e) if e.should_retry() => {
                    warn!(
                        identifier = %record.identifier,
                        version = %record.version,
                        attempt = state.attempt,
                        "Download attempt failed: {}",
                        e
                    );
                    if state.attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                Err(e) => {
                    remove_partial(&state.path).await;
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, record: &FirmwareRecord, state: &mut DownloadState) -> Result<()> {
        let response = self.http.get_from(&record.url, state.bytes_on_disk).await?;

        let mut file = match response.status() {
            StatusCode::PARTIAL_CONTENT if state.bytes_on_disk > 0 => {
                debug!("Resuming {} from byte {}", state.path.display(), state.bytes_on_disk);
                if state.remote_size.is_none() {
                    state.remote_size = total_from_content_range(&response);
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false)
                    .open(&state.path)
                    .await?;
                file.seek(SeekFrom::Start(state.bytes_on_disk)).await?;
                file
            }
            status if status.is_success() => {
                if state.bytes_on_disk > 0 {
                    warn!("Server ignored range request, restarting {}", state.path.display());
                }
                state.bytes_on_disk = 0;
                if state.remote_size.is_none() {
                    state.remote_size = response.content_length().filter(|&len| len > 0);
                }
                File::create(&state.path).await?
            }
            StatusCode::RANGE_NOT_SATISFIABLE => return Err(ProtocolError::RangeNotSatisfiable),
            StatusCode::SERVICE_UNAVAILABLE => return Err(ProtocolError::ServiceUnavailable),
            status => return Err(ProtocolError::HttpStatus(status)),
        };

        let mut stream = response.bytes_stream();
        let mut since_flush = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            file.write_all(&chunk).await?;

            state.bytes_on_disk += chunk.len() as u64;
            since_flush += chunk.len() as u64;

            if since_flush >= self.config.flush_interval {
                file.flush().await?;
                since_flush = 0;
                debug!(bytes = state.bytes_on_disk, "Progress {}", state.path.display());
            }
        }

        file.flush().await?;

        if let Some(total) = state.remote_size
            && state.bytes_on_disk < total
        {
            return Err(ProtocolError::IncompleteBody {
                expected: total,
                actual: state.bytes_on_disk,
            });
        }

        info!(bytes = state.bytes_on_disk, "Downloaded {}", state.path.display());
        Ok(())
    }

    async fn verify(&self, path: &Path, record: &FirmwareRecord) -> Result<bool> {
        let verifier = self.verifier;
        let path = path.to_path_buf();
        let sha1 = record.sha1sum.clone();
        let md5 = record.md5sum.clone();

        let matched =
            tokio::task::spawn_blocking(move || verifier.matches_either(&path, &sha1, &md5))
                .await??;
        Ok(matched)
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header
fn total_from_content_range(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_completeness() {
        let mut state = DownloadState::new(PathBuf::from("/tmp/x.ipsw"), None);
        assert!(!state.is_complete());

        state.remote_size = Some(100);
        state.bytes_on_disk = 99;
        assert!(!state.is_complete());

        state.bytes_on_disk = 100;
        assert!(state.is_complete());
    }
}

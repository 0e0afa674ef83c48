//! Publishing results to a git branch
//!
//! Every publish runs under one process-wide lock: the working tree and index
//! are shared by all device tasks.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;
use crate::tools::run_checked;

/// Branch that receives harvested files
pub const DEFAULT_BRANCH: &str = "files";

/// Sink for finished and ignored versions
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish the artifacts of a completed version
    async fn publish_completed(&self, identifier: &str, version: &str) -> Result<()>;

    /// Publish the updated ignored list of an entity
    async fn publish_ignored(&self, identifier: &str, version: &str, ignored_file: &Path)
    -> Result<()>;
}

/// Commits and pushes through the `git` command line
#[derive(Debug)]
pub struct GitPublisher {
    repo_dir: PathBuf,
    branch: String,
    lock: Mutex<()>,
}

impl GitPublisher {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            branch: DEFAULT_BRANCH.to_string(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Switch the working tree to the publishing branch
    pub async fn prepare(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.git(&["switch", self.branch.as_str()]).await
    }

    async fn git(&self, args: &[&str]) -> Result<()> {
        run_checked("git", args, Some(self.repo_dir.as_path())).await?;
        Ok(())
    }

    async fn commit_and_push(&self, sparse_path: &str, add_path: &str, message: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        self.git(&["sparse-checkout", "add", sparse_path]).await?;
        self.git(&["add", add_path]).await?;
        self.git(&["commit", "-m", message]).await?;
        self.git(&["push", "origin", self.branch.as_str()]).await?;

        info!("Published: {}", message);
        Ok(())
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.repo_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish_completed(&self, identifier: &str, version: &str) -> Result<()> {
        self.commit_and_push(
            &format!("{identifier}/{version}/*"),
            identifier,
            &format!("added {version} ipcc files for {identifier}"),
        )
        .await
    }

    async fn publish_ignored(
        &self,
        identifier: &str,
        version: &str,
        ignored_file: &Path,
    ) -> Result<()> {
        let ignored = self.relative(ignored_file);
        self.commit_and_push(
            &ignored,
            &ignored,
            &format!("Ignored {version} for {identifier}"),
        )
        .await
    }
}

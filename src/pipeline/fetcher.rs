//! Source model snapshot retrieval from the Hugging Face Hub.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Hugging Face Hub error: {0}")]
    Hub(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retrieves a named model snapshot into a local directory.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Materialize `repo` at `revision` under `dest`; returns `dest`.
    async fn fetch(&self, repo: &str, revision: &str, dest: &Path) -> Result<PathBuf, FetchError>;
}

/// Fetcher backed by the hf-hub client and its local cache.
#[derive(Debug, Default, Clone)]
pub struct HfHubFetcher {
    /// Overrides the hub cache directory (`HF_HOME` otherwise).
    pub cache_dir: Option<PathBuf>,
}

#[async_trait]
impl ArtifactFetcher for HfHubFetcher {
    async fn fetch(&self, repo: &str, revision: &str, dest: &Path) -> Result<PathBuf, FetchError> {
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(ref dir) = self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().map_err(|e| FetchError::Hub(e.to_string()))?;
        let repo_api = api.repo(Repo::with_revision(
            repo.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let info = repo_api
            .info()
            .await
            .map_err(|e| FetchError::Hub(format!("{repo}@{revision}: {e}")))?;

        info!(repo, revision, files = info.siblings.len(), dest = %dest.display(), "Fetching snapshot");
        tokio::fs::create_dir_all(dest).await?;

        for sibling in &info.siblings {
            let cached = repo_api
                .get(&sibling.rfilename)
                .await
                .map_err(|e| FetchError::Hub(format!("{}: {e}", sibling.rfilename)))?;
            let target = dest.join(&sibling.rfilename);
            if materialize(&cached, &target).await? {
                debug!(file = %sibling.rfilename, "Fetched");
            } else {
                debug!(file = %sibling.rfilename, "Already present");
            }
        }

        Ok(dest.to_path_buf())
    }
}

/// Place `cached` at `target` unless an identical-length copy is already there.
///
/// The copy lands in a sibling `.part` file and is renamed into place, so an
/// interrupted copy never leaves a truncated file at `target`. Returns whether
/// a copy was made.
pub async fn materialize(cached: &Path, target: &Path) -> Result<bool, FetchError> {
    let expected = tokio::fs::metadata(cached).await?.len();
    if let Ok(existing) = tokio::fs::metadata(target).await {
        if existing.is_file() && existing.len() == expected {
            return Ok(false);
        }
        warn!(
            target = %target.display(),
            found = existing.len(),
            expected,
            "Replacing incomplete file"
        );
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut part = target.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    tokio::fs::copy(cached, &part).await?;
    tokio::fs::rename(&part, target).await?;
    Ok(true)
}

//! Download of the detector model files.
//!
//! Weights are large, so files already present are left alone. Each file is
//! downloaded next to its destination under a `.part` name and only renamed
//! into place once complete, so an interrupted run never leaves a truncated
//! file that a later run would skip.

use futures::future::try_join_all;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::config::ModelsConfig;
use crate::stager::{download_to, StagingError};

/// Errors that can occur while installing model files.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Invalid model URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: StagingError,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// What an install run did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub downloaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

enum FileOutcome {
    Downloaded(PathBuf),
    Skipped(PathBuf),
}

/// Fetches the configured model files into the model directory.
pub struct ModelInstaller {
    client: Client,
    directory: PathBuf,
    urls: Vec<String>,
}

impl ModelInstaller {
    pub fn new(config: &ModelsConfig) -> Result<Self, InstallError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            client,
            directory: config.directory.clone(),
            urls: config.urls.clone(),
        })
    }

    /// Download every missing file. Downloads run concurrently; the first
    /// failure fails the run.
    #[instrument(skip(self), fields(directory = %self.directory.display()))]
    pub async fn install(&self) -> Result<InstallReport, InstallError> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| InstallError::Io {
                path: self.directory.clone(),
                source,
            })?;

        let outcomes = try_join_all(self.urls.iter().map(|url| self.install_one(url))).await?;

        let mut report = InstallReport::default();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Downloaded(path) => report.downloaded.push(path),
                FileOutcome::Skipped(path) => report.skipped.push(path),
            }
        }

        info!(
            downloaded = report.downloaded.len(),
            skipped = report.skipped.len(),
            "Model files installed"
        );
        Ok(report)
    }

    async fn install_one(&self, raw: &str) -> Result<FileOutcome, InstallError> {
        let url = Url::parse(raw).map_err(|_| InstallError::InvalidUrl(raw.to_string()))?;
        let name = file_name(&url).ok_or_else(|| InstallError::InvalidUrl(raw.to_string()))?;
        let destination = self.directory.join(&name);

        if fs::try_exists(&destination).await.unwrap_or(false) {
            info!(file = %name, "Model file already on disk, skipping");
            return Ok(FileOutcome::Skipped(destination));
        }

        info!(url = %url, "Downloading model file");
        let partial = self.directory.join(format!("{}.part", name));

        let bytes = match download_to(&self.client, &url, &partial).await {
            Ok(bytes) => bytes,
            Err(source) => {
                discard(&partial).await;
                return Err(InstallError::Download {
                    url: url.to_string(),
                    source,
                });
            }
        };

        fs::rename(&partial, &destination)
            .await
            .map_err(|source| InstallError::Io {
                path: destination.clone(),
                source,
            })?;

        info!(file = %name, bytes = bytes, "Model file downloaded");
        Ok(FileOutcome::Downloaded(destination))
    }
}

/// Last URL path segment, if it names a file.
fn file_name(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(String::from)
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

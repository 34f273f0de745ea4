//! Asset staging: materialize a request's source into a scratch directory.

use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::config::StagingConfig;
use crate::resource_store::{ResourceStore, StoreError};

/// Errors that can occur while staging an asset.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to allocate scratch directory: {0}")]
    Store(#[from] StoreError),

    #[error("Download failed: {0}")]
    Transfer(#[from] reqwest::Error),

    #[error("Download of {url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("Failed to write asset: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported source locator: {0}")]
    UnsupportedLocator(String),

    #[error("Local file sources are disabled")]
    LocalFilesDisabled,
}

/// Where a source locator points.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Remote(Url),
    Local(PathBuf),
}

impl Source {
    fn parse(locator: &str) -> Result<Self, StagingError> {
        match Url::parse(locator) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Source::Remote(url)),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(Source::Local)
                .map_err(|_| StagingError::UnsupportedLocator(locator.to_string())),
            Ok(_) => Err(StagingError::UnsupportedLocator(locator.to_string())),
            Err(_) if Path::new(locator).is_absolute() => Ok(Source::Local(PathBuf::from(locator))),
            Err(_) => Err(StagingError::UnsupportedLocator(locator.to_string())),
        }
    }

    /// File name the staged asset is stored under.
    fn file_name(&self) -> String {
        let raw = match self {
            Source::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_string(),
            Source::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        sanitize_file_name(&raw)
    }
}

/// Downloads or copies request assets into the scratch store.
#[derive(Clone)]
pub struct AssetStager {
    store: ResourceStore,
    client: Client,
    allow_local_files: bool,
}

impl AssetStager {
    pub fn new(store: ResourceStore, config: &StagingConfig) -> Result<Self, StagingError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            store,
            client,
            allow_local_files: config.allow_local_files,
        })
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Stage `locator` and return the local path of the asset.
    ///
    /// The scratch directory is allocated before the transfer starts. A failed
    /// transfer leaves it in place; the store's expiry timer reclaims it.
    #[instrument(skip(self))]
    pub async fn stage(&self, locator: &str) -> Result<PathBuf, StagingError> {
        let source = Source::parse(locator)?;
        if matches!(source, Source::Local(_)) && !self.allow_local_files {
            return Err(StagingError::LocalFilesDisabled);
        }

        let dir = self.store.create().await?;
        let destination = dir.join(source.file_name());

        let bytes = match &source {
            Source::Remote(url) => download_to(&self.client, url, &destination).await?,
            Source::Local(path) => fs::copy(path, &destination).await?,
        };

        metrics::counter!("darknode.staging.bytes").increment(bytes);
        info!(
            destination = %destination.display(),
            bytes = bytes,
            "Asset staged"
        );

        Ok(destination)
    }
}

/// Stream `url` into a new file at `destination`. Returns the bytes written.
pub(crate) async fn download_to(
    client: &Client,
    url: &Url,
    destination: &Path,
) -> Result<u64, StagingError> {
    debug!(url = %url, "Downloading asset");

    let response = client.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(StagingError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let mut file = fs::File::create(destination).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    Ok(written)
}

/// Keep a file name safe to join below the scratch directory.
pub(crate) fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    if sanitized.trim_matches('.').is_empty() {
        "asset".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn stager(tmp: &TempDir, ttl: Duration, allow_local_files: bool) -> AssetStager {
        let store = ResourceStore::new(tmp.path().join("scratch"), ttl);
        let config = StagingConfig {
            allow_local_files,
            connect_timeout_secs: 2,
            request_timeout_secs: 5,
            ..Default::default()
        };
        AssetStager::new(store, &config).unwrap()
    }

    /// Serve a single canned HTTP response.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status_line,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("clip.mp4"), "clip.mp4");
        assert_eq!(sanitize_file_name("my clip.mp4"), "my_clip.mp4");
        assert_eq!(sanitize_file_name(".."), "asset");
        assert_eq!(sanitize_file_name(""), "asset");
    }

    #[test]
    fn test_source_parse() {
        assert!(matches!(
            Source::parse("https://cdn.example.com/a/cat.jpg?x=1"),
            Ok(Source::Remote(_))
        ));
        assert!(matches!(Source::parse("/srv/cat.jpg"), Ok(Source::Local(_))));
        assert!(matches!(Source::parse("file:///srv/cat.jpg"), Ok(Source::Local(_))));
        assert!(matches!(
            Source::parse("ftp://example.com/cat.jpg"),
            Err(StagingError::UnsupportedLocator(_))
        ));
        assert!(matches!(
            Source::parse("cat.jpg"),
            Err(StagingError::UnsupportedLocator(_))
        ));
    }

    #[test]
    fn test_source_file_name() {
        let source = Source::parse("https://cdn.example.com/a/cat.jpg?x=1").unwrap();
        assert_eq!(source.file_name(), "cat.jpg");

        let source = Source::parse("https://cdn.example.com/").unwrap();
        assert_eq!(source.file_name(), "asset");
    }

    #[tokio::test]
    async fn test_stage_download() {
        let tmp = TempDir::new().unwrap();
        let stager = stager(&tmp, Duration::from_secs(60), false);
        let base = serve_once("200 OK", b"fake-jpeg").await;

        let path = stager.stage(&format!("{}/img/cat.jpg", base)).await.unwrap();

        assert_eq!(path.file_name().unwrap(), "cat.jpg");
        assert!(path.starts_with(stager.store().root()));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"fake-jpeg");
        stager.store().shutdown();
    }

    #[tokio::test]
    async fn test_stage_local_copy() {
        let tmp = TempDir::new().unwrap();
        let stager = stager(&tmp, Duration::from_secs(60), true);
        let source = tmp.path().join("dog.png");
        tokio::fs::write(&source, b"png").await.unwrap();

        let path = stager.stage(source.to_str().unwrap()).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "dog.png");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png");
        stager.store().shutdown();
    }

    #[tokio::test]
    async fn test_local_files_disabled_by_default() {
        let tmp = TempDir::new().unwrap();
        let stager = stager(&tmp, Duration::from_secs(60), false);

        let result = stager.stage("/etc/hostname").await;
        assert!(matches!(result, Err(StagingError::LocalFilesDisabled)));
        assert!(stager.store().is_empty());
    }

    #[tokio::test]
    async fn test_failed_status_leaves_directory_until_expiry() {
        let tmp = TempDir::new().unwrap();
        let stager = stager(&tmp, Duration::from_millis(400), false);
        let base = serve_once("404 Not Found", b"missing").await;

        let result = stager.stage(&format!("{}/gone.mp4", base)).await;
        assert!(matches!(result, Err(StagingError::Status { .. })));

        let entries = stager.store().entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path.exists());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!entries[0].path.exists());
    }

    #[tokio::test]
    async fn test_connection_failure_is_staging_error() {
        let tmp = TempDir::new().unwrap();
        let stager = stager(&tmp, Duration::from_secs(60), false);

        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = stager.stage(&format!("http://{}/cat.jpg", addr)).await;
        assert!(matches!(result, Err(StagingError::Transfer(_))));
        assert_eq!(stager.store().len(), 1);
        stager.store().shutdown();
    }
}

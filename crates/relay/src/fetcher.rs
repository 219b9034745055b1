// crates/relay/src/fetcher.rs
//! Artifact retrieval: stream a bundle to disk, then unpack or rename it.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use async_trait::async_trait;
use futures_util::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::error::TransferError;

const TEMP_PREFIX: &str = "ml_project";
const TEMP_SUFFIX: &str = ".zip";

/// Where a fetched artifact ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Extract the bundle's entries into this directory.
    Directory(PathBuf),
    /// Store the raw bundle at exactly this path.
    File(PathBuf),
}

impl Destination {
    /// A trailing separator or an existing directory means "extract here".
    pub async fn classify(raw: &str) -> Self {
        let path = PathBuf::from(raw);
        let trailing = raw.ends_with('/') || raw.ends_with(MAIN_SEPARATOR);
        let existing_dir = !trailing
            && tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
        if trailing || existing_dir {
            Destination::Directory(path)
        } else {
            Destination::File(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Destination::Directory(p) | Destination::File(p) => p,
        }
    }

    /// Directory the temporary bundle is written to before it is moved or unpacked.
    pub fn staging_dir(&self) -> PathBuf {
        match self {
            Destination::Directory(dir) => dir.clone(),
            Destination::File(file) => file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Summary of a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub destination: PathBuf,
    pub bytes: u64,
    /// Number of archive entries unpacked; zero for file destinations.
    pub extracted_entries: usize,
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(
        &self,
        source_url: &str,
        destination: &Destination,
    ) -> Result<FetchReport, TransferError>;
}

/// Fetches bundles over HTTP with a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(
        &self,
        source_url: &str,
        destination: &Destination,
    ) -> Result<FetchReport, TransferError> {
        tracing::info!(url = %source_url, destination = %destination.path().display(), "Downloading artifact");

        let staging = destination.staging_dir();
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| TransferError::io(&staging, e))?;

        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(TransferError::Http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status { status });
        }

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&staging)
            .map_err(|e| TransferError::io(&staging, e))?;
        let bytes = write_body(response, temp.path()).await?;

        let report = match destination {
            Destination::Directory(dir) => {
                let extracted_entries = extract_bundle(temp, dir.clone()).await?;
                FetchReport {
                    destination: dir.clone(),
                    bytes,
                    extracted_entries,
                }
            }
            Destination::File(target) => {
                persist_bundle(temp, target)?;
                FetchReport {
                    destination: target.clone(),
                    bytes,
                    extracted_entries: 0,
                }
            }
        };

        tracing::info!(
            destination = %report.destination.display(),
            bytes = report.bytes,
            entries = report.extracted_entries,
            "Artifact downloaded"
        );
        Ok(report)
    }
}

async fn write_body(response: reqwest::Response, path: &Path) -> Result<u64, TransferError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;

    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TransferError::Http)?;
        file.write_all(&chunk)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| TransferError::io(path, e))?;
    file.sync_all().await.map_err(|e| TransferError::io(path, e))?;
    Ok(written)
}

/// Unpack on a blocking thread. Entries already written stay on failure.
async fn extract_bundle(temp: NamedTempFile, dir: PathBuf) -> Result<usize, TransferError> {
    tokio::task::spawn_blocking(move || -> Result<usize, TransferError> {
        let file = temp
            .reopen()
            .map_err(|e| TransferError::io(temp.path(), e))?;
        let mut archive = zip::ZipArchive::new(file)?;
        let entries = archive.len();
        archive.extract(&dir)?;
        let temp_path = temp.path().to_path_buf();
        temp.close().map_err(|e| TransferError::io(temp_path, e))?;
        Ok(entries)
    })
    .await
    .map_err(|e| TransferError::Task(e.to_string()))?
}

fn persist_bundle(temp: NamedTempFile, target: &Path) -> Result<(), TransferError> {
    if target.exists() {
        std::fs::remove_file(target).map_err(|e| TransferError::io(target, e))?;
    }
    temp.persist(target)
        .map_err(|e| TransferError::io(target, e.error))?;
    Ok(())
}

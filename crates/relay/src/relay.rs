// crates/relay/src/relay.rs
//! Job relay: drives one backend generation request, forwards its progress
//! lines to the session's event channel and retrieves the result artifact.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::channel::EventChannel;
use crate::error::{BackendRequestError, RelayError};
use crate::fetcher::{ArtifactFetcher, Destination, FetchReport, HttpArtifactFetcher};
use crate::telemetry::preview;

/// Path of the generation endpoint, relative to the backend base URL.
pub const JOB_ENDPOINT: &str = "/generate-ml-project/";

const EVENT_MARKER: &str = "data:";
const DOWNLOAD_MARKER: &str = "download:";

/// Input to one relay run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub user_prompt: String,
    pub target_variable: String,
    pub file_path: String,
    #[serde(default)]
    pub download_location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub backend_url: String,
    /// End-to-end bound on every backend request.
    pub job_timeout: Duration,
    /// Used when a request carries no download location.
    pub default_destination: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000".to_string(),
            job_timeout: Duration::from_secs(3600),
            default_destination: "./Project_Directory/".to_string(),
        }
    }
}

/// One decoded line of the backend event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Ignored,
    Progress(String),
    /// Terminal marker; carries the download path.
    Download(String),
}

pub fn classify_line(line: &str) -> StreamLine {
    let Some(rest) = line.strip_prefix(EVENT_MARKER) else {
        return StreamLine::Ignored;
    };
    let payload = rest.trim();
    match payload.strip_prefix(DOWNLOAD_MARKER) {
        Some(path) => StreamLine::Download(path.trim().to_string()),
        None => StreamLine::Progress(payload.to_string()),
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySuccess {
    pub destination: String,
    pub download_url: Option<String>,
    pub events_forwarded: usize,
    pub artifact: Option<FetchReport>,
}

impl RelaySuccess {
    pub fn message(&self) -> String {
        format!(
            "Successfully created ml project with expected specifications inside Project_Directory folder at {}",
            self.destination
        )
    }
}

#[derive(Debug, Default)]
struct JobRun {
    download_path: Option<String>,
    events_forwarded: usize,
}

pub struct JobRelay {
    client: reqwest::Client,
    settings: RelaySettings,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl JobRelay {
    /// Build a relay with its own HTTP client and the HTTP artifact fetcher.
    pub fn new(settings: RelaySettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.job_timeout)
            .build()?;
        let fetcher = Arc::new(HttpArtifactFetcher::new(client.clone()));
        Ok(Self::with_fetcher(settings, client, fetcher))
    }

    pub fn with_fetcher(
        settings: RelaySettings,
        client: reqwest::Client,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            client,
            settings,
            fetcher,
        }
    }

    fn base_url(&self) -> &str {
        self.settings.backend_url.trim_end_matches('/')
    }

    /// Turn a download path announced by the backend into an absolute URL.
    pub fn resolve_download_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }

    /// Run one job to completion.
    ///
    /// Progress lines are published in the order they are read. Reading stops
    /// at the first download marker. Publishing never fails the run; a dead
    /// channel just turns later publishes into no-ops.
    pub async fn run(
        &self,
        request: &JobRequest,
        events: &EventChannel,
        cancel: &CancellationToken,
    ) -> Result<RelaySuccess, RelayError> {
        let destination = request
            .download_location
            .clone()
            .unwrap_or_else(|| self.settings.default_destination.clone());
        let url = format!("{}{}", self.base_url(), JOB_ENDPOINT);
        tracing::info!(
            url = %url,
            prompt = %preview(&request.user_prompt),
            "Starting ML project generation"
        );

        let mut form = vec![
            ("user_prompt", request.user_prompt.as_str()),
            ("target_variable", request.target_variable.as_str()),
            ("file_path", request.file_path.as_str()),
            ("sse", "true"),
        ];
        if let Some(location) = request.download_location.as_deref() {
            form.push(("download_location", location));
        }

        let response = until_cancelled(cancel, self.client.post(&url).form(&form).send())
            .await?
            .map_err(BackendRequestError::Connect)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendRequestError::Status { status }.into());
        }
        tracing::info!(status = %status, "Streaming response started");

        let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let mut reader = StreamReader::new(body);
        let mut buf = Vec::new();
        let mut run = JobRun::default();

        while let Some(line) = until_cancelled(cancel, read_line_lossy(&mut reader, &mut buf))
            .await?
            .map_err(BackendRequestError::Stream)?
        {
            match classify_line(&line) {
                StreamLine::Ignored => {}
                StreamLine::Progress(message) => {
                    until_cancelled(cancel, events.publish(&message)).await?;
                    run.events_forwarded += 1;
                    tracing::debug!(payload = %preview(&message), "Forwarded event");
                }
                StreamLine::Download(path) => {
                    run.download_path = Some(path);
                    break;
                }
            }
        }
        drop(reader);

        let download_url = run
            .download_path
            .as_deref()
            .map(|path| self.resolve_download_url(path));
        tracing::info!(download_url = ?download_url, "Backend event phase complete");

        let artifact = match download_url.as_deref() {
            Some(source) => {
                let target = Destination::classify(&destination).await;
                Some(until_cancelled(cancel, self.fetcher.fetch(source, &target)).await??)
            }
            None => {
                tracing::warn!("Backend stream ended without a download path, skipping artifact retrieval");
                None
            }
        };

        until_cancelled(cancel, events.publish(&format!("download_ready: {destination}"))).await?;
        tracing::info!(destination = %destination, "File downloaded and available");

        Ok(RelaySuccess {
            destination,
            download_url,
            events_forwarded: run.events_forwarded,
            artifact,
        })
    }
}

/// Next line without its `\n` or `\r\n`. Invalid UTF-8 is replaced, not rejected.
async fn read_line_lossy<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, RelayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        out = fut => Ok(out),
    }
}

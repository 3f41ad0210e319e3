//! Remote stem separation HTTP client
//!
//! One attempt of each network stage: a bounded-time health probe against
//! `{service_url}/health`, and a multipart upload/download exchange with
//! `{service_url}/separate` that writes the response archive to a local
//! path. Retrying is the caller's concern (see [`crate::services::retry`]).

use futures::StreamExt;
use reqwest::multipart;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Request timeout for the health probe
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall deadline for one upload/download exchange, independent of the
/// transport's own timeouts
pub const SEPARATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Separation client errors
#[derive(Debug, Error)]
pub enum SeparationError {
    /// Could not reach the service (connection refused, DNS failure)
    #[error("Cannot connect to separation service: {0}")]
    Connect(String),

    /// A request or the whole exchange exceeded its deadline
    #[error("Separation request timed out after {0:?}")]
    Timeout(Duration),

    /// Service responded with a non-success HTTP status
    #[error("Separation service returned HTTP {0}: {1}")]
    HttpStatus(u16, String),

    /// Health endpoint answered but without a recognizable status marker
    #[error("Health response did not contain a recognizable status marker")]
    UnhealthyResponse,

    /// Transfer-level failure (request build, body read, decode)
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// The archive file is missing or zero-length after the exchange
    #[error("No response received from separation service (empty archive)")]
    EmptyResponse,

    /// Destination directory for the archive could not be created
    #[error("Failed to create output directory {0}: {1}")]
    DirectoryCreation(PathBuf, String),

    /// Cancellation was requested mid-transfer
    #[error("Cancelled")]
    Cancelled,

    /// Local I/O failure while writing the archive
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeparationError {
    /// Heuristic transient/permanent classification.
    ///
    /// Transient failures plausibly succeed on retry (network blips, server
    /// overload); permanent ones will not. The remote service does not
    /// document a precise error contract, so this is a pluggable allow-list,
    /// used only to shape user-facing messages - the retry loop itself
    /// retries unconditionally up to its attempt cap.
    pub fn is_transient(&self) -> bool {
        match self {
            SeparationError::Connect(_) => true,
            SeparationError::Timeout(_) => true,
            SeparationError::UnhealthyResponse => true,
            SeparationError::HttpStatus(status, body) => {
                *status >= 500 || body.contains("temporarily unavailable")
            }
            SeparationError::UploadFailed(message) => message.contains("temporarily unavailable"),
            SeparationError::EmptyResponse
            | SeparationError::DirectoryCreation(_, _)
            | SeparationError::Cancelled
            | SeparationError::Io(_) => false,
        }
    }
}

/// HTTP client for the remote stem separation service
pub struct RemoteSeparationClient {
    http: reqwest::Client,
    service_url: String,
    output_format: String,
    bitrate: u32,
}

impl RemoteSeparationClient {
    /// Create a client for the given service URL
    pub fn new(
        service_url: impl Into<String>,
        output_format: impl Into<String>,
        bitrate: u32,
    ) -> Result<Self, SeparationError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SeparationError::UploadFailed(e.to_string()))?;

        Ok(Self {
            http,
            service_url: service_url.into().trim_end_matches('/').to_string(),
            output_format: output_format.into(),
            bitrate,
        })
    }

    /// One attempt of the health probe
    ///
    /// Success requires the request to complete within [`HEALTH_TIMEOUT`]
    /// and the body to contain a recognizable healthy-status marker.
    pub async fn probe_health(&self) -> Result<(), SeparationError> {
        let url = format!("{}/health", self.service_url);
        tracing::debug!(url = %url, "Probing separation service health");

        let response = self
            .http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, HEALTH_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SeparationError::HttpStatus(status.as_u16(), body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(e, HEALTH_TIMEOUT))?;

        if body.contains("healthy") || body.contains("status") {
            Ok(())
        } else {
            Err(SeparationError::UnhealthyResponse)
        }
    }

    /// One attempt of the separation exchange
    ///
    /// Uploads `input_file` as multipart form data and streams the response
    /// archive to `archive_path`. Enforces [`SEPARATE_TIMEOUT`] across the
    /// whole exchange and checks `cancel` between response chunks, so
    /// cancellation latency is bounded by chunk arrival, not the deadline.
    pub async fn separate(
        &self,
        input_file: &Path,
        archive_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SeparationError> {
        if let Some(parent) = archive_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SeparationError::DirectoryCreation(parent.to_path_buf(), e.to_string())
            })?;
        }

        let deadline = tokio::time::Instant::now() + SEPARATE_TIMEOUT;

        let payload = tokio::fs::read(input_file).await?;
        let file_name = input_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input.wav".to_string());

        let part = multipart::Part::bytes(payload)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| SeparationError::UploadFailed(e.to_string()))?;
        let form = multipart::Form::new()
            .part("audio_file", part)
            .text("format", self.output_format.clone())
            .text("bitrate", self.bitrate.to_string());

        let url = format!("{}/separate", self.service_url);
        tracing::info!(
            url = %url,
            input = %input_file.display(),
            "Uploading audio for separation"
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SeparationError::Cancelled),
            result = tokio::time::timeout_at(deadline, self.http.post(&url).multipart(form).send()) => {
                match result {
                    Err(_) => return Err(SeparationError::Timeout(SEPARATE_TIMEOUT)),
                    Ok(inner) => inner.map_err(|e| classify_transport_error(e, SEPARATE_TIMEOUT))?,
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SeparationError::HttpStatus(status.as_u16(), body));
        }

        let mut file = tokio::fs::File::create(archive_path).await?;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(archive_path).await;
                    return Err(SeparationError::Cancelled);
                }
                next = tokio::time::timeout_at(deadline, stream.next()) => {
                    match next {
                        Err(_) => {
                            drop(file);
                            let _ = tokio::fs::remove_file(archive_path).await;
                            return Err(SeparationError::Timeout(SEPARATE_TIMEOUT));
                        }
                        Ok(None) => break,
                        Ok(Some(chunk)) => {
                            chunk.map_err(|e| classify_transport_error(e, SEPARATE_TIMEOUT))?
                        }
                    }
                }
            };
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        drop(file);

        let archive_len = tokio::fs::metadata(archive_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if archive_len == 0 {
            let _ = tokio::fs::remove_file(archive_path).await;
            return Err(SeparationError::EmptyResponse);
        }

        tracing::info!(
            archive = %archive_path.display(),
            bytes = archive_len,
            "Separation archive downloaded"
        );
        Ok(())
    }
}

fn classify_transport_error(e: reqwest::Error, deadline: Duration) -> SeparationError {
    if e.is_timeout() {
        SeparationError::Timeout(deadline)
    } else if e.is_connect() {
        SeparationError::Connect(e.to_string())
    } else {
        SeparationError::UploadFailed(e.to_string())
    }
}

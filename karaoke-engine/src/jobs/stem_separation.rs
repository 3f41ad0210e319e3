//! Stem separation job
//!
//! Drives one session's separation from start to finish:
//! `Init -> ProbingHealth -> Uploading -> Extracting -> PostProcessing ->
//! Done`. The two network stages run under the shared retry loop; extraction
//! failure is terminal; a failed backing-track mixdown degrades to success
//! because the job's primary deliverable is the stems.

use crate::jobs::{JobOutcome, JobReporter, MixdownJob};
use crate::services::archive;
use crate::services::retry::{with_retry, RetryError, RetryPolicy};
use crate::services::separation_client::RemoteSeparationClient;
use karaoke_common::config::EngineConfig;
use karaoke_common::events::{EventBus, JobKind};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Temporary archive name inside the session's stem directory
const ARCHIVE_FILE: &str = "stems_temp.zip";

/// Stem separation job for one session
pub struct StemSeparationJob {
    config: EngineConfig,
    input_file: PathBuf,
    output_dir: PathBuf,
    bus: EventBus,
    cancel: CancellationToken,
}

impl StemSeparationJob {
    pub fn new(
        config: EngineConfig,
        input_file: PathBuf,
        output_dir: PathBuf,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            input_file,
            output_dir,
            bus,
            cancel,
        }
    }

    /// Run the separation to completion, returning the terminal outcome
    pub async fn run(&self, reporter: &JobReporter) -> JobOutcome {
        reporter.progress(0.0, "Initializing stem processor...");

        // Init: fail fast on missing preconditions before any network work
        if self.config.service_url.is_empty() {
            return JobOutcome::failed("Separation service URL is not configured");
        }
        if !self.input_file.exists() {
            return JobOutcome::failed(format!(
                "Input file not found: {}",
                self.input_file.display()
            ));
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.output_dir).await {
            return JobOutcome::failed(format!(
                "Failed to create output directory {}: {}",
                self.output_dir.display(),
                e
            ));
        }

        let client = match RemoteSeparationClient::new(
            &self.config.service_url,
            &self.config.output_format,
            self.config.bitrate,
        ) {
            Ok(client) => client,
            Err(e) => return JobOutcome::failed(format!("Failed to create HTTP client: {}", e)),
        };

        let policy = RetryPolicy::from(&self.config);

        // ProbingHealth
        reporter.progress(0.05, "Checking stem separation service...");
        match with_retry(policy, &self.cancel, || client.probe_health()).await {
            Ok(()) => {}
            Err(RetryError::Cancelled) => {
                return JobOutcome::failed("Stem separation cancelled");
            }
            Err(RetryError::Exhausted(e)) => {
                tracing::warn!(
                    service_url = %self.config.service_url,
                    transient = e.is_transient(),
                    error = %e,
                    "Health probe exhausted retries"
                );
                return JobOutcome::failed(format!(
                    "Stem separation service is not available after multiple attempts: {}. \
                     Please start the service and try again.",
                    e
                ));
            }
        }

        // Uploading
        reporter.progress(0.15, "Sending audio for processing...");
        let archive_path = self.output_dir.join(ARCHIVE_FILE);
        let upload = with_retry(policy, &self.cancel, || {
            reporter.progress(0.3, "Uploading audio file...");
            client.separate(&self.input_file, &archive_path, &self.cancel)
        })
        .await;
        match upload {
            Ok(()) => {}
            Err(RetryError::Cancelled) => {
                return JobOutcome::failed("Stem separation cancelled");
            }
            Err(RetryError::Exhausted(e)) => {
                return JobOutcome::failed(format!(
                    "Audio processing failed after multiple attempts: {}",
                    e
                ));
            }
        }

        // Extracting
        if self.cancel.is_cancelled() {
            return JobOutcome::failed("Stem separation cancelled");
        }
        reporter.progress(0.88, "Extracting stems...");
        let extract_archive = archive_path.clone();
        let extract_dest = self.output_dir.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            archive::extract(&extract_archive, &extract_dest)
        })
        .await;
        let _ = tokio::fs::remove_file(&archive_path).await;

        match extracted {
            Ok(Ok(files)) => {
                tracing::info!(stems = files.len(), "Stems extracted");
            }
            Ok(Err(e)) => {
                return JobOutcome::failed(format!("Failed to extract stems: {}", e));
            }
            Err(e) => {
                return JobOutcome::failed(format!("Extraction task failed: {}", e));
            }
        }

        // PostProcessing: backing-track generation is best-effort
        if self.cancel.is_cancelled() {
            return JobOutcome::failed("Stem separation cancelled");
        }
        reporter.progress(0.9, "Generating karaoke track...");
        let mixdown = MixdownJob::new(&self.config, self.output_dir.clone(), self.cancel.clone());
        let mixdown_reporter =
            JobReporter::new(self.bus.clone(), reporter.session_id(), JobKind::Mixdown);
        let mixdown_outcome = mixdown.run(&mixdown_reporter).await;
        let backing_track_ok = mixdown_outcome.success;
        mixdown_reporter.finish(&mixdown_outcome);

        if backing_track_ok {
            reporter.progress(1.0, "Stem separation completed!");
            JobOutcome::ok("Stems separated successfully and backing track generated")
        } else {
            // Degraded success: the stems themselves are the deliverable
            reporter.progress(1.0, "Karaoke generation failed, but stems are available");
            JobOutcome::ok(format!(
                "Stems separated successfully, but backing track generation failed: {}",
                mixdown_outcome.message
            ))
        }
    }
}

//! Vocal mix job
//!
//! Trims the recorded take by a fixed lead-in to compensate for capture-path
//! latency, then mixes the trimmed take with the backing track into the
//! final output. A failed trim aborts the whole job - untrimmed audio is
//! never mixed silently.

use crate::jobs::{JobOutcome, JobReporter};
use crate::services::process;
use karaoke_common::config::EngineConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lead-in removed from the recorded take, in seconds
pub const LATENCY_TRIM_SECONDS: f64 = 0.1;

/// Deadline for the trim invocation
pub const TRIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the final mix invocation
pub const MIX_TIMEOUT: Duration = Duration::from_secs(60);

/// Mono-vocals + backing track mix filter. Converts the mono take to stereo,
/// mixes equal-weighted over the longest duration, and normalizes loudness.
const MIX_FILTER: &str = "[0:a]volume=1.0,pan=stereo|c0=c0|c1=c0[vocals_stereo];\
[1:a]volume=1.0[karaoke];\
[vocals_stereo][karaoke]amix=inputs=2:duration=longest:dropout_transition=3,\
loudnorm=I=-13:LRA=11:TP=-1.5";

/// Vocal mix job: recorded take + backing track -> finished mix
pub struct VocalMixJob {
    ffmpeg: String,
    recording_file: PathBuf,
    backing_track: PathBuf,
    output_file: PathBuf,
    cancel: CancellationToken,
}

impl VocalMixJob {
    pub fn new(
        config: &EngineConfig,
        recording_file: PathBuf,
        backing_track: PathBuf,
        output_file: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            recording_file,
            backing_track,
            output_file,
            cancel,
        }
    }

    /// Run the vocal mix to completion, returning the terminal outcome
    pub async fn run(&self, reporter: &JobReporter) -> JobOutcome {
        reporter.progress(0.05, "Checking mixing tool availability...");
        if let Err(e) = process::check_invocable(&self.ffmpeg).await {
            return JobOutcome::failed(format!(
                "Mixing tool is not available: {}. Install ffmpeg and try again.",
                e
            ));
        }

        reporter.progress(0.15, "Verifying input files...");
        if let Err(e) = process::check_inputs_exist(&[&self.recording_file, &self.backing_track]) {
            return JobOutcome::failed(format!("Cannot mix vocals: {}", e));
        }

        if self.cancel.is_cancelled() {
            return JobOutcome::failed("Vocal mix cancelled");
        }

        reporter.progress(0.25, "Trimming recording for latency compensation...");
        let trimmed = match self.trim_recording(reporter).await {
            Ok(path) => path,
            Err(e) => {
                return JobOutcome::failed(format!(
                    "Failed to trim recording for latency compensation: {}",
                    e
                ))
            }
        };

        if let Some(parent) = self.output_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return JobOutcome::failed(format!(
                    "Failed to create output directory {}: {}",
                    parent.display(),
                    e
                ));
            }
        }

        if self.cancel.is_cancelled() {
            return JobOutcome::failed("Vocal mix cancelled");
        }

        reporter.progress(0.5, "Mixing vocals with backing track...");
        let args = vec![
            "-i".to_string(),
            trimmed.display().to_string(),
            "-i".to_string(),
            self.backing_track.display().to_string(),
            "-filter_complex".to_string(),
            MIX_FILTER.to_string(),
            "-c:a".to_string(),
            "mp3".to_string(),
            "-b:a".to_string(),
            "320k".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            "-y".to_string(),
            self.output_file.display().to_string(),
        ];

        let result = process::run_supervised(
            &self.ffmpeg,
            &args,
            MIX_TIMEOUT,
            Some(&self.output_file),
            &self.cancel,
            |ratio, elapsed| {
                reporter.progress(
                    0.5 + 0.4 * ratio,
                    format!("Mixing audio... ({}s)", elapsed),
                );
            },
        )
        .await;

        // The trimmed take is an intermediate; clean it up either way
        let _ = tokio::fs::remove_file(&trimmed).await;

        match result {
            Ok(_) => {
                reporter.progress(1.0, "Vocal mixing complete");
                JobOutcome::ok(format!(
                    "Vocals mixed with backing track: {}",
                    self.output_file.display()
                ))
            }
            Err(e) => JobOutcome::failed(format!("Failed to mix vocals: {}", e)),
        }
    }

    /// Remove the capture-path lead-in, producing a derived temporary file
    async fn trim_recording(&self, reporter: &JobReporter) -> Result<PathBuf, process::ToolError> {
        let trimmed = trimmed_path(&self.recording_file);

        let args = vec![
            "-i".to_string(),
            self.recording_file.display().to_string(),
            "-af".to_string(),
            format!("atrim=start={}", LATENCY_TRIM_SECONDS),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            "-y".to_string(),
            trimmed.display().to_string(),
        ];

        process::run_supervised(
            &self.ffmpeg,
            &args,
            TRIM_TIMEOUT,
            Some(&trimmed),
            &self.cancel,
            |ratio, elapsed| {
                reporter.progress(
                    0.25 + 0.2 * ratio,
                    format!("Trimming recording... ({}s)", elapsed),
                );
            },
        )
        .await?;

        Ok(trimmed)
    }
}

/// Sibling path for the latency-trimmed take
fn trimmed_path(recording: &Path) -> PathBuf {
    let stem = recording
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    let ext = recording
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".to_string());
    recording.with_file_name(format!("{}_trim100ms.{}", stem, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use karaoke_common::events::{EventBus, JobKind};
    use uuid::Uuid;

    fn test_reporter(bus: &EventBus) -> JobReporter {
        JobReporter::new(bus.clone(), Uuid::new_v4(), JobKind::VocalMix)
    }

    #[test]
    fn test_trimmed_path_suffix() {
        let path = trimmed_path(Path::new("/tmp/take_20250101.wav"));
        assert_eq!(path, Path::new("/tmp/take_20250101_trim100ms.wav"));
    }

    #[tokio::test]
    async fn test_missing_recording_named_in_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backing = dir.path().join("karaoke.mp3");
        std::fs::write(&backing, b"x").unwrap();

        let mut config = EngineConfig::default();
        // Invocability probe passes; the missing take must be reported next
        #[cfg(unix)]
        {
            config.ffmpeg_path = "true".to_string();
        }

        let recording = dir.path().join("take.wav");
        let bus = EventBus::new(16);
        let job = VocalMixJob::new(
            &config,
            recording.clone(),
            backing,
            dir.path().join("final.mp3"),
            CancellationToken::new(),
        );
        let outcome = job.run(&test_reporter(&bus)).await;

        assert!(!outcome.success);
        #[cfg(unix)]
        assert!(outcome.message.contains("take.wav"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_trim_failure_aborts_job() {
        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("take.wav");
        let backing = dir.path().join("karaoke.mp3");
        std::fs::write(&recording, b"x").unwrap();
        std::fs::write(&backing, b"x").unwrap();

        // "true" exits 0 but creates no trimmed file, so the trim stage
        // fails on the missing expected output
        let mut config = EngineConfig::default();
        config.ffmpeg_path = "true".to_string();

        let bus = EventBus::new(16);
        let output = dir.path().join("final.mp3");
        let job = VocalMixJob::new(
            &config,
            recording,
            backing,
            output.clone(),
            CancellationToken::new(),
        );
        let outcome = job.run(&test_reporter(&bus)).await;

        assert!(!outcome.success);
        assert!(outcome.message.contains("latency compensation"));
        assert!(!output.exists(), "mix must not run after a failed trim");
    }
}

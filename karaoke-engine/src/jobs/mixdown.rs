//! Backing-track mixdown job
//!
//! Combines the extracted non-vocal stems (drums, bass, other) into a single
//! backing track with the external mixing tool. Equal-weighted mix, longest
//! duration, zero dropout transition.

use crate::jobs::{JobOutcome, JobReporter};
use crate::services::process;
use karaoke_common::config::EngineConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backing track file name inside the session's stem directory
pub const BACKING_TRACK_FILE: &str = "karaoke.mp3";

/// Deadline for one mixdown invocation
pub const MIXDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Mixdown job: non-vocal stems -> backing track
pub struct MixdownJob {
    ffmpeg: String,
    stems_dir: PathBuf,
    stem_ext: String,
    cancel: CancellationToken,
}

impl MixdownJob {
    pub fn new(config: &EngineConfig, stems_dir: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            stems_dir,
            stem_ext: config.output_format.clone(),
            cancel,
        }
    }

    /// Where this job writes the backing track for a given stem directory
    pub fn backing_track_path(stems_dir: &Path) -> PathBuf {
        stems_dir.join(BACKING_TRACK_FILE)
    }

    /// Run the mixdown to completion, returning the terminal outcome
    pub async fn run(&self, reporter: &JobReporter) -> JobOutcome {
        reporter.progress(0.05, "Checking mixing tool availability...");
        if let Err(e) = process::check_invocable(&self.ffmpeg).await {
            return JobOutcome::failed(format!(
                "Mixing tool is not available: {}. Install ffmpeg and try again.",
                e
            ));
        }

        reporter.progress(0.1, "Verifying stem files...");
        let drums = self.stem_path("drums");
        let bass = self.stem_path("bass");
        let other = self.stem_path("other");
        if let Err(e) = process::check_inputs_exist(&[&drums, &bass, &other]) {
            return JobOutcome::failed(format!("Cannot generate backing track: {}", e));
        }

        if self.cancel.is_cancelled() {
            return JobOutcome::failed("Mixdown cancelled");
        }

        let output = Self::backing_track_path(&self.stems_dir);
        let args = vec![
            "-i".to_string(),
            drums.display().to_string(),
            "-i".to_string(),
            bass.display().to_string(),
            "-i".to_string(),
            other.display().to_string(),
            "-filter_complex".to_string(),
            "[0:a][1:a][2:a]amix=inputs=3:duration=longest:dropout_transition=0".to_string(),
            "-c:a".to_string(),
            "mp3".to_string(),
            "-b:a".to_string(),
            "320k".to_string(),
            "-y".to_string(),
            output.display().to_string(),
        ];

        reporter.progress(0.2, "Mixing backing track...");
        let result = process::run_supervised(
            &self.ffmpeg,
            &args,
            MIXDOWN_TIMEOUT,
            Some(&output),
            &self.cancel,
            |ratio, elapsed| {
                reporter.progress(
                    0.2 + 0.7 * ratio,
                    format!("Mixing backing track... ({}s)", elapsed),
                );
            },
        )
        .await;

        match result {
            Ok(_) => {
                reporter.progress(1.0, "Backing track generated");
                JobOutcome::ok(format!(
                    "Backing track generated successfully: {}",
                    output.display()
                ))
            }
            Err(e) => JobOutcome::failed(format!("Failed to generate backing track: {}", e)),
        }
    }

    fn stem_path(&self, stem: &str) -> PathBuf {
        self.stems_dir.join(format!("{}.{}", stem, self.stem_ext))
    }
}

//! Session orchestration
//!
//! Joins the two independently-completing pipelines - network-bound stem
//! separation and realtime-bound vocal recording - into a single downstream
//! vocal mix, exactly once per session, regardless of arrival order. The
//! join is an explicit little state machine (two ready flags plus a
//! `mix_requested` latch) rather than checks scattered across callback
//! sites, so the exactly-once guarantee is auditable in isolation from
//! networking and process code.
//!
//! All methods run on the control side: background jobs communicate with the
//! orchestrator only through bus events forwarded into [`SessionOrchestrator::handle_event`].

use crate::jobs::{JobReporter, MixdownJob, StemSeparationJob, VocalMixJob};
use karaoke_common::config::EngineConfig;
use karaoke_common::events::{EventBus, JobKind, KaraokeEvent, WaitingFor};
use karaoke_common::{Error, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Final mix file name inside the session's stem directory
pub const MIXED_FILE: &str = "final_mix.mp3";

/// Per-session state
///
/// One session per loaded input file. Replaced wholesale on a new load;
/// events from a superseded session are discarded by id comparison.
#[derive(Debug)]
pub struct Session {
    /// Session UUID, carried in every event the session's jobs emit
    pub id: Uuid,
    /// Originally loaded audio file
    pub input_file: PathBuf,
    /// Unique per-session directory for stems and derived files
    pub stem_output_dir: PathBuf,
    /// Most recently completed full-length take, if any
    pub recording_file: Option<PathBuf>,
    /// Finished vocals + backing mix, if any
    pub mixed_file: Option<PathBuf>,
    stems_ready: bool,
    recording_ready: bool,
    mix_requested: bool,
}

impl Session {
    fn new(id: Uuid, input_file: PathBuf, stem_output_dir: PathBuf) -> Self {
        Self {
            id,
            input_file,
            stem_output_dir,
            recording_file: None,
            mixed_file: None,
            stems_ready: false,
            recording_ready: false,
            mix_requested: false,
        }
    }

    /// Backing track exists (stem separation and mixdown finished)
    pub fn stems_ready(&self) -> bool {
        self.stems_ready
    }

    /// A complete, full-length take has been captured
    pub fn recording_ready(&self) -> bool {
        self.recording_ready
    }

    /// The vocal mix has been requested (latched; never re-triggered)
    pub fn mix_requested(&self) -> bool {
        self.mix_requested
    }

    /// Where this session's backing track lands once mixdown succeeds
    pub fn backing_track_path(&self) -> PathBuf {
        MixdownJob::backing_track_path(&self.stem_output_dir)
    }
}

/// Top-level reconciliation component
pub struct SessionOrchestrator {
    config: EngineConfig,
    bus: EventBus,
    work_root: PathBuf,
    session: Option<Session>,
}

impl SessionOrchestrator {
    pub fn new(config: EngineConfig, bus: EventBus, work_root: PathBuf) -> Self {
        Self {
            config,
            bus,
            work_root,
            session: None,
        }
    }

    /// Current session, if a file has been loaded
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Load a new input file, replacing any previous session.
    ///
    /// Spawns the stem separation job on its own task. In-flight jobs from
    /// the previous session are allowed to run to completion; their events
    /// carry the old session id and are ignored. The stem directory is
    /// unique per session so repeated loads never collide.
    pub fn load_file(&mut self, input_file: &Path) -> Result<Uuid> {
        if !input_file.exists() {
            return Err(Error::NotFound(format!(
                "Input file not found: {}",
                input_file.display()
            )));
        }

        let session_id = Uuid::new_v4();
        let stem_dir = self
            .work_root
            .join(format!("stems_{}", session_id.simple()));
        std::fs::create_dir_all(&stem_dir)?;

        tracing::info!(
            session_id = %session_id,
            input = %input_file.display(),
            stem_dir = %stem_dir.display(),
            "Starting new session"
        );

        self.session = Some(Session::new(
            session_id,
            input_file.to_path_buf(),
            stem_dir.clone(),
        ));

        let _ = self.bus.emit(KaraokeEvent::SessionStarted {
            session_id,
            input_file: input_file.to_path_buf(),
            timestamp: chrono::Utc::now(),
        });

        let job = StemSeparationJob::new(
            self.config.clone(),
            input_file.to_path_buf(),
            stem_dir,
            self.bus.clone(),
            CancellationToken::new(),
        );
        let reporter = JobReporter::new(self.bus.clone(), session_id, JobKind::StemSeparation);
        tokio::spawn(async move {
            let outcome = job.run(&reporter).await;
            reporter.finish(&outcome);
        });

        Ok(session_id)
    }

    /// React to a bus event.
    ///
    /// The control loop that owns the orchestrator forwards every bus event
    /// here; events from superseded sessions are discarded.
    pub fn handle_event(&mut self, event: &KaraokeEvent) {
        match event {
            KaraokeEvent::JobFinished {
                session_id,
                job,
                success,
                message,
                ..
            } => self.on_job_finished(*session_id, *job, *success, message),
            KaraokeEvent::RecordingCompleted {
                session_id,
                path,
                full_track,
                ..
            } => self.on_recording_complete(*session_id, path, *full_track),
            _ => {}
        }
    }

    fn on_job_finished(&mut self, session_id: Uuid, job: JobKind, success: bool, message: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.id != session_id {
            tracing::debug!(
                stale_session = %session_id,
                current_session = %session.id,
                job = %job,
                "Ignoring event from superseded session"
            );
            return;
        }

        match job {
            JobKind::StemSeparation => {
                if !success {
                    // The failure event itself is the user notification;
                    // nothing to reconcile
                    return;
                }
                // Separation can succeed in degraded mode with no backing
                // track on disk; launching the mix then would only burn the
                // once-per-session trigger on a guaranteed failure
                if !session.backing_track_path().exists() {
                    tracing::warn!(
                        session_id = %session_id,
                        "No backing track after separation; vocal mix unavailable"
                    );
                    if session.recording_ready {
                        let _ = self.bus.emit(KaraokeEvent::SessionWaiting {
                            session_id,
                            waiting_for: WaitingFor::Stems,
                            timestamp: chrono::Utc::now(),
                        });
                    }
                    return;
                }
                session.stems_ready = true;
                if session.recording_ready && !session.mix_requested {
                    self.trigger_vocal_mix();
                } else if !session.recording_ready {
                    let _ = self.bus.emit(KaraokeEvent::SessionWaiting {
                        session_id,
                        waiting_for: WaitingFor::Recording,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
            JobKind::Mixdown => {
                // Informational; the stems-ready decision keys off the
                // separation job's terminal event
            }
            JobKind::VocalMix => {
                if success {
                    let mixed = session.stem_output_dir.join(MIXED_FILE);
                    session.mixed_file = Some(mixed.clone());
                    let _ = self.bus.emit(KaraokeEvent::MixedTrackReady {
                        session_id,
                        path: mixed,
                        timestamp: chrono::Utc::now(),
                    });
                } else {
                    // mix_requested stays latched: a fresh recording or a
                    // fresh load is required to try again
                    tracing::error!(session_id = %session_id, error = %message, "Vocal mix failed");
                }
            }
        }
    }

    fn on_recording_complete(&mut self, session_id: Uuid, path: &Path, full_track: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.id != session_id {
            tracing::debug!(
                stale_session = %session_id,
                "Ignoring recording from superseded session"
            );
            return;
        }

        session.recording_file = Some(path.to_path_buf());

        if !full_track {
            tracing::info!(
                session_id = %session_id,
                take = %path.display(),
                "Partial take captured; waiting for a full-length recording"
            );
            return;
        }

        session.recording_ready = true;

        // The backing track must actually exist on disk before mixing:
        // stems_ready alone is not enough when mixdown degraded to
        // stems-only success
        if session.backing_track_path().exists() {
            if !session.mix_requested {
                self.trigger_vocal_mix();
            }
        } else {
            let _ = self.bus.emit(KaraokeEvent::SessionWaiting {
                session_id,
                waiting_for: WaitingFor::Stems,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Start the vocal mix job and latch `mix_requested`.
    ///
    /// Callers check the latch first; the guard here is the single point
    /// that enforces the exactly-once invariant.
    fn trigger_vocal_mix(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.mix_requested {
            return;
        }
        let Some(recording) = session.recording_file.clone() else {
            return;
        };
        session.mix_requested = true;

        let output = session.stem_output_dir.join(MIXED_FILE);
        tracing::info!(
            session_id = %session.id,
            recording = %recording.display(),
            output = %output.display(),
            "Both halves ready, starting vocal mix"
        );

        let job = VocalMixJob::new(
            &self.config,
            recording,
            session.backing_track_path(),
            output,
            CancellationToken::new(),
        );
        let reporter = JobReporter::new(self.bus.clone(), session.id, JobKind::VocalMix);
        tokio::spawn(async move {
            let outcome = job.run(&reporter).await;
            reporter.finish(&outcome);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(session_id: Uuid, job: JobKind, success: bool) -> KaraokeEvent {
        KaraokeEvent::JobFinished {
            session_id,
            job,
            success,
            message: String::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn recorded(session_id: Uuid, path: &Path, full_track: bool) -> KaraokeEvent {
        KaraokeEvent::RecordingCompleted {
            session_id,
            path: path.to_path_buf(),
            full_track,
            timestamp: chrono::Utc::now(),
        }
    }

    struct Fixture {
        orchestrator: SessionOrchestrator,
        session_id: Uuid,
        take: PathBuf,
        _dir: tempfile::TempDir,
    }

    /// Orchestrator with a loaded session. The separation job it spawns
    /// fails fast against an unroutable service URL; these tests drive the
    /// state machine directly through synthetic events.
    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("song.wav");
        std::fs::write(&input, b"riff").unwrap();
        let take = dir.path().join("take.wav");
        std::fs::write(&take, b"la la la").unwrap();

        let mut config = EngineConfig::default();
        config.service_url = "http://127.0.0.1:1".to_string();
        config.max_retries = 0;
        config.ffmpeg_path = "no-such-tool-xyz".to_string();

        let bus = EventBus::new(64);
        let mut orchestrator =
            SessionOrchestrator::new(config, bus, dir.path().join("work"));
        let session_id = orchestrator.load_file(&input).unwrap();

        Fixture {
            orchestrator,
            session_id,
            take,
            _dir: dir,
        }
    }

    fn create_backing_track(orchestrator: &SessionOrchestrator) {
        let path = orchestrator.session().unwrap().backing_track_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"instrumental").unwrap();
    }

    #[tokio::test]
    async fn test_stems_first_then_recording_triggers_once() {
        let mut fx = fixture().await;
        create_backing_track(&fx.orchestrator);

        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        let session = fx.orchestrator.session().unwrap();
        assert!(session.stems_ready());
        assert!(!session.mix_requested(), "no recording yet");

        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        let session = fx.orchestrator.session().unwrap();
        assert!(session.recording_ready());
        assert!(session.mix_requested(), "both halves ready");
    }

    #[tokio::test]
    async fn test_recording_first_then_stems_triggers_once() {
        let mut fx = fixture().await;

        // Recording arrives first: backing track not on disk yet, so the
        // orchestrator waits without latching
        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        let session = fx.orchestrator.session().unwrap();
        assert!(session.recording_ready());
        assert!(!session.mix_requested());

        create_backing_track(&fx.orchestrator);
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        let session = fx.orchestrator.session().unwrap();
        assert!(session.stems_ready());
        assert!(session.mix_requested());
    }

    #[tokio::test]
    async fn test_duplicate_ready_events_do_not_retrigger() {
        let mut fx = fixture().await;
        create_backing_track(&fx.orchestrator);

        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        assert!(fx.orchestrator.session().unwrap().mix_requested());

        // Replays of either event must not restart the mix; the latch holds
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        assert!(fx.orchestrator.session().unwrap().mix_requested());
    }

    #[tokio::test]
    async fn test_degraded_separation_does_not_burn_mix_trigger() {
        let mut fx = fixture().await;

        // Recording first, then separation finishes in degraded mode: stems
        // extracted but no backing track was generated
        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));

        let session = fx.orchestrator.session().unwrap();
        assert!(
            !session.stems_ready(),
            "stems_ready must track the backing track on disk"
        );
        assert!(
            !session.mix_requested(),
            "a doomed mix must not consume the once-per-session trigger"
        );

        // Once a backing track does exist, a replayed ready event still mixes
        create_backing_track(&fx.orchestrator);
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        let session = fx.orchestrator.session().unwrap();
        assert!(session.stems_ready());
        assert!(session.mix_requested());
    }

    #[tokio::test]
    async fn test_partial_take_does_not_count() {
        let mut fx = fixture().await;
        create_backing_track(&fx.orchestrator);

        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, false));
        let session = fx.orchestrator.session().unwrap();
        assert!(!session.recording_ready());
        assert!(session.recording_file.is_some(), "take path is still kept");

        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        assert!(
            !fx.orchestrator.session().unwrap().mix_requested(),
            "a partial take must not satisfy the recording half"
        );
    }

    #[tokio::test]
    async fn test_stale_session_events_ignored() {
        let mut fx = fixture().await;
        create_backing_track(&fx.orchestrator);
        let stale_id = Uuid::new_v4();

        fx.orchestrator
            .handle_event(&recorded(stale_id, &fx.take, true));
        fx.orchestrator
            .handle_event(&finished(stale_id, JobKind::StemSeparation, true));

        let session = fx.orchestrator.session().unwrap();
        assert!(!session.stems_ready());
        assert!(!session.recording_ready());
        assert!(!session.mix_requested());
    }

    #[tokio::test]
    async fn test_new_load_resets_flags() {
        let mut fx = fixture().await;
        create_backing_track(&fx.orchestrator);

        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        assert!(fx.orchestrator.session().unwrap().mix_requested());

        let input2 = fx._dir.path().join("song2.wav");
        std::fs::write(&input2, b"other riff").unwrap();
        let new_id = fx.orchestrator.load_file(&input2).unwrap();
        assert_ne!(new_id, fx.session_id);

        let session = fx.orchestrator.session().unwrap();
        assert!(!session.stems_ready());
        assert!(!session.recording_ready());
        assert!(!session.mix_requested());
        assert!(session.recording_file.is_none());

        // Late events from the old session no longer touch the new one
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        assert!(!fx.orchestrator.session().unwrap().stems_ready());
    }

    #[tokio::test]
    async fn test_separate_sessions_get_distinct_stem_dirs() {
        let mut fx = fixture().await;
        let first_dir = fx
            .orchestrator
            .session()
            .unwrap()
            .stem_output_dir
            .clone();

        let input2 = fx._dir.path().join("song2.wav");
        std::fs::write(&input2, b"other riff").unwrap();
        fx.orchestrator.load_file(&input2).unwrap();
        let second_dir = &fx.orchestrator.session().unwrap().stem_output_dir;

        assert_ne!(&first_dir, second_dir);
    }

    #[tokio::test]
    async fn test_vocal_mix_failure_keeps_latch() {
        let mut fx = fixture().await;
        create_backing_track(&fx.orchestrator);

        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        assert!(fx.orchestrator.session().unwrap().mix_requested());

        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::VocalMix, false));
        let session = fx.orchestrator.session().unwrap();
        assert!(session.mix_requested(), "no automatic re-trigger");
        assert!(session.mixed_file.is_none());
    }

    #[tokio::test]
    async fn test_vocal_mix_success_publishes_mixed_file() {
        let mut fx = fixture().await;
        create_backing_track(&fx.orchestrator);

        fx.orchestrator
            .handle_event(&recorded(fx.session_id, &fx.take, true));
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::StemSeparation, true));
        fx.orchestrator
            .handle_event(&finished(fx.session_id, JobKind::VocalMix, true));

        let session = fx.orchestrator.session().unwrap();
        let mixed = session.mixed_file.clone().unwrap();
        assert!(mixed.ends_with(MIXED_FILE));
    }

    #[tokio::test]
    async fn test_load_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let mut orchestrator = SessionOrchestrator::new(
            EngineConfig::default(),
            bus,
            dir.path().join("work"),
        );

        let result = orchestrator.load_file(&dir.path().join("missing.wav"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}

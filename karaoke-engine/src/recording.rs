//! Recording coordinator
//!
//! Collaborator boundary around the capture path. The engine does not own
//! device enumeration or sample-level capture; the host's audio callback
//! pushes sample blocks in, and the coordinator writes them to a mono WAV
//! take. The active writer is the one shared resource in the system that
//! needs a lock: the capture callback and control-side start/stop must
//! never race on it.

use hound::{SampleFormat, WavSpec, WavWriter};
use karaoke_common::events::{EventBus, KaraokeEvent};
use karaoke_common::{Error, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

struct ActiveTake {
    session_id: Uuid,
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
}

/// Drives the capture writer and reports take completion as an event
pub struct RecordingCoordinator {
    bus: EventBus,
    take_dir: PathBuf,
    spec: WavSpec,
    active: Arc<Mutex<Option<ActiveTake>>>,
}

impl RecordingCoordinator {
    /// Mono 16-bit coordinator writing takes into `take_dir`
    pub fn new(bus: EventBus, take_dir: PathBuf, sample_rate: u32) -> Self {
        Self {
            bus,
            take_dir,
            spec: WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            },
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a new take for the given session.
    ///
    /// Any take already in progress is finalized first and reported as a
    /// partial (non-full-track) recording.
    pub fn start(&self, session_id: Uuid) -> Result<PathBuf> {
        self.stop(false);

        std::fs::create_dir_all(&self.take_dir)?;
        // Random suffix keeps rapid restart takes from colliding
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let nonce = Uuid::new_v4().simple().to_string();
        let path = self
            .take_dir
            .join(format!("karaoke_take_{}_{}.wav", timestamp, &nonce[..8]));

        let writer = WavWriter::create(&path, self.spec)
            .map_err(|e| Error::Internal(format!("Failed to create take writer: {}", e)))?;

        tracing::info!(
            session_id = %session_id,
            take = %path.display(),
            "Recording started"
        );

        let mut guard = self
            .active
            .lock()
            .map_err(|_| Error::Internal("Recording writer lock poisoned".to_string()))?;
        *guard = Some(ActiveTake {
            session_id,
            path: path.clone(),
            writer,
        });

        Ok(path)
    }

    /// Append a block of f32 samples from the capture callback.
    ///
    /// Holds the writer lock only for the duration of the block write.
    /// Silently drops samples when no take is active, matching capture
    /// callbacks that keep firing across stop boundaries.
    pub fn write_samples(&self, samples: &[f32]) {
        let Ok(mut guard) = self.active.lock() else {
            return;
        };
        let Some(take) = guard.as_mut() else {
            return;
        };
        for sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            let value = (clamped * i16::MAX as f32) as i16;
            if let Err(e) = take.writer.write_sample(value) {
                tracing::warn!(error = %e, "Dropping sample block after write failure");
                return;
            }
        }
    }

    /// Stop the active take, finalize the file, and emit
    /// `RecordingCompleted`.
    ///
    /// `full_track` marks whether the take spanned the whole song (vs. a
    /// manual stop); only full-track takes satisfy the recording half of the
    /// session reconciliation. Returns the take path, or `None` when no
    /// take was active. The writer is swapped out under the lock and
    /// finalized outside it so the capture callback is never blocked on the
    /// flush.
    pub fn stop(&self, full_track: bool) -> Option<PathBuf> {
        let take = {
            let mut guard = self.active.lock().ok()?;
            guard.take()?
        };

        let ActiveTake {
            session_id,
            path,
            writer,
        } = take;

        if let Err(e) = writer.finalize() {
            tracing::warn!(take = %path.display(), error = %e, "Failed to finalize take");
        }

        tracing::info!(
            session_id = %session_id,
            take = %path.display(),
            full_track = full_track,
            "Recording completed"
        );

        let _ = self.bus.emit(KaraokeEvent::RecordingCompleted {
            session_id,
            path: path.clone(),
            full_track,
            timestamp: chrono::Utc::now(),
        });

        Some(path)
    }

    /// Whether a take is currently being written
    pub fn is_recording(&self) -> bool {
        self.active
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(dir: &std::path::Path) -> (RecordingCoordinator, EventBus) {
        let bus = EventBus::new(16);
        (
            RecordingCoordinator::new(bus.clone(), dir.to_path_buf(), 44_100),
            bus,
        )
    }

    #[tokio::test]
    async fn test_take_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, bus) = coordinator(dir.path());
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();

        assert!(!coordinator.is_recording());
        let path = coordinator.start(session_id).unwrap();
        assert!(coordinator.is_recording());

        coordinator.write_samples(&[0.0, 0.5, -0.5, 1.0]);
        let stopped = coordinator.stop(true).unwrap();
        assert_eq!(stopped, path);
        assert!(!coordinator.is_recording());

        // File is a readable WAV with the written samples
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 4);

        match rx.recv().await.unwrap() {
            KaraokeEvent::RecordingCompleted {
                session_id: event_session,
                full_track,
                path: event_path,
                ..
            } => {
                assert_eq!(event_session, session_id);
                assert!(full_track);
                assert_eq!(event_path, path);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_finalizes_previous_take_as_partial() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, bus) = coordinator(dir.path());
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();

        let first = coordinator.start(session_id).unwrap();
        coordinator.write_samples(&[0.1; 64]);
        // Second start replaces the first take
        let second = coordinator.start(session_id).unwrap();
        assert!(coordinator.is_recording());

        match rx.recv().await.unwrap() {
            KaraokeEvent::RecordingCompleted {
                path, full_track, ..
            } => {
                assert_eq!(path, first);
                assert!(!full_track, "an interrupted take is not full-track");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        coordinator.stop(true);
        assert_ne!(first, second);
    }

    #[test]
    fn test_stop_without_active_take_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _bus) = coordinator(dir.path());
        assert!(coordinator.stop(true).is_none());
    }

    #[test]
    fn test_samples_dropped_when_not_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _bus) = coordinator(dir.path());
        // Must not panic or create files
        coordinator.write_samples(&[0.5; 128]);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}

//! Background jobs
//!
//! Each long-running operation (stem separation, mixdown, vocal mix) runs on
//! its own spawned task as a single sequential flow of stages. Jobs report
//! through a [`JobReporter`]: any number of progress events followed by
//! exactly one terminal event. Failures never propagate across the task
//! boundary as panics - they are always converted into a failed
//! [`JobOutcome`].

pub mod mixdown;
pub mod stem_separation;
pub mod vocal_mix;

pub use mixdown::MixdownJob;
pub use stem_separation::StemSeparationJob;
pub use vocal_mix::VocalMixJob;

use karaoke_common::events::{EventBus, JobKind, KaraokeEvent};
use uuid::Uuid;

/// Terminal result of one background job run
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Whether the job succeeded
    pub success: bool,
    /// Outcome description; failures carry the most specific diagnostic
    /// available
    pub message: String,
}

impl JobOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Event emitter for one job run
///
/// `finish` consumes the reporter, so at most one terminal event can ever be
/// emitted per run by construction. Events may arrive from a worker task;
/// subscribers marshal UI mutations onto their own thread.
pub struct JobReporter {
    bus: EventBus,
    session_id: Uuid,
    job: JobKind,
}

impl JobReporter {
    pub fn new(bus: EventBus, session_id: Uuid, job: JobKind) -> Self {
        Self {
            bus,
            session_id,
            job,
        }
    }

    /// Session this reporter belongs to
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Emit a fractional progress update
    ///
    /// A missing subscriber is not an error: the engine core must keep
    /// working when nothing is listening yet.
    pub fn progress(&self, fraction: f64, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(
            job = %self.job,
            fraction = fraction,
            status = %message,
            "Job progress"
        );
        let _ = self.bus.emit(KaraokeEvent::JobProgress {
            session_id: self.session_id,
            job: self.job,
            fraction,
            message,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Emit the terminal event, consuming the reporter
    pub fn finish(self, outcome: &JobOutcome) {
        if outcome.success {
            tracing::info!(job = %self.job, message = %outcome.message, "Job finished");
        } else {
            tracing::error!(job = %self.job, message = %outcome.message, "Job failed");
        }
        let _ = self.bus.emit(KaraokeEvent::JobFinished {
            session_id: self.session_id,
            job: self.job,
            success: outcome.success,
            message: outcome.message.clone(),
            timestamp: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reporter_emits_progress_then_single_terminal() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();

        let reporter = JobReporter::new(bus.clone(), session_id, JobKind::Mixdown);
        reporter.progress(0.2, "Verifying input files...");
        reporter.progress(0.6, "Mixing backing track...");
        reporter.finish(&JobOutcome::ok("Backing track generated"));

        match rx.recv().await.unwrap() {
            KaraokeEvent::JobProgress { fraction, .. } => assert!((fraction - 0.2).abs() < 1e-9),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            KaraokeEvent::JobProgress { fraction, .. } => assert!((fraction - 0.6).abs() < 1e-9),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            KaraokeEvent::JobFinished { success, job, .. } => {
                assert!(success);
                assert_eq!(job, JobKind::Mixdown);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_reporter_survives_missing_subscribers() {
        let bus = EventBus::new(4);
        let reporter = JobReporter::new(bus, Uuid::new_v4(), JobKind::VocalMix);
        reporter.progress(0.1, "no one is listening");
        reporter.finish(&JobOutcome::failed("still fine"));
    }
}

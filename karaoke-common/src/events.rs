//! Event types for the karaoke engine
//!
//! Background jobs never call into UI code directly: they emit events on the
//! [`EventBus`] and the control side (orchestrator, CLI, plugin editor)
//! subscribes and marshals updates onto its own thread. A job is a producer
//! of a bounded event sequence: zero or more `JobProgress` events followed by
//! exactly one `JobFinished`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identifies which background job emitted a progress or terminal event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Remote stem separation (health probe, upload, extraction, mixdown)
    StemSeparation,
    /// Backing-track mixdown of the non-vocal stems
    Mixdown,
    /// Final vocals + backing track mix
    VocalMix,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::StemSeparation => write!(f, "stem-separation"),
            JobKind::Mixdown => write!(f, "mixdown"),
            JobKind::VocalMix => write!(f, "vocal-mix"),
        }
    }
}

/// Engine event types
///
/// Broadcast via [`EventBus`]; serializable so a host shell can forward them
/// over SSE or any other transport unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KaraokeEvent {
    /// A new session replaced the previous one (file load)
    SessionStarted {
        /// Session UUID
        session_id: Uuid,
        /// Originally loaded audio file
        input_file: PathBuf,
        /// When the session started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Fractional progress from a background job
    ///
    /// Fraction is 0.0..=1.0, monotonically non-decreasing by convention.
    /// Consumers must tolerate arbitrary-frequency updates.
    JobProgress {
        /// Session the job belongs to
        session_id: Uuid,
        /// Which job emitted the update
        job: JobKind,
        /// Fractional completion, 0.0..=1.0
        fraction: f64,
        /// Human-readable status line
        message: String,
        /// When the update was emitted
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Terminal outcome of a background job (exactly one per job run)
    JobFinished {
        /// Session the job belongs to
        session_id: Uuid,
        /// Which job finished
        job: JobKind,
        /// Whether the job succeeded
        success: bool,
        /// Outcome description; for failures, the most specific diagnostic
        /// available (captured tool output, exit codes, HTTP status)
        message: String,
        /// When the job finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A recording session completed
    RecordingCompleted {
        /// Session the take belongs to
        session_id: Uuid,
        /// Path of the captured take
        path: PathBuf,
        /// Whether the take spanned the full track (vs. a manual stop)
        full_track: bool,
        /// When the recording stopped
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One half of the session is ready and the other is still pending
    SessionWaiting {
        /// Session that is waiting
        session_id: Uuid,
        /// What the session is waiting for
        waiting_for: WaitingFor,
        /// When the waiting state was entered
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The final vocals + backing mix is ready for playback
    MixedTrackReady {
        /// Session the mix belongs to
        session_id: Uuid,
        /// Path of the finished mix
        path: PathBuf,
        /// When the mix completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Which half of the reconciliation a waiting session is blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitingFor {
    /// Stems/backing track not ready yet (recording arrived first)
    Stems,
    /// No completed full-length take yet (stems arrived first)
    Recording,
}

/// Broadcast event bus shared between jobs and the control side
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KaraokeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity
    ///
    /// Old events are dropped for lagging subscribers once the buffer fills.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<KaraokeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)`, or `Err` if no subscriber is
    /// listening. A job must not treat a missing subscriber as fatal.
    pub fn emit(
        &self,
        event: KaraokeEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<KaraokeEvent>> {
        self.tx.send(event)
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

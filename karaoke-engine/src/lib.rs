//! karaoke-engine - asynchronous remote-processing orchestration
//!
//! The core behind the karaoke plugin: invokes the remote stem separation
//! service under unreliable network conditions, coordinates the multi-stage
//! background work (separation -> backing-track mixdown -> vocal mix), and
//! reconciles the independently-completing recording and separation
//! pipelines into a single final mix.
//!
//! The surrounding host shell (waveform painting, transport buttons, plugin
//! plumbing) talks to this crate only through [`karaoke_common::events::EventBus`]
//! subscriptions and the [`session::SessionOrchestrator`] /
//! [`recording::RecordingCoordinator`] entry points.

pub mod jobs;
pub mod recording;
pub mod services;
pub mod session;

pub use recording::RecordingCoordinator;
pub use session::SessionOrchestrator;

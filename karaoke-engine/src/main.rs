//! karaoke-engine - headless pipeline driver
//!
//! Runs the engine core without a plugin host: loads a song, drives the
//! remote separation pipeline, and - when a pre-recorded take is supplied -
//! the full reconciliation through to the final vocal mix. Progress events
//! are rendered to the log.

use anyhow::Result;
use clap::Parser;
use karaoke_common::config::{resolve_service_url, EngineConfig};
use karaoke_common::events::{EventBus, JobKind, KaraokeEvent, WaitingFor};
use karaoke_engine::services::{RemoteSeparationClient, ServiceManager};
use karaoke_engine::SessionOrchestrator;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "karaoke-engine", about = "Karaoke stem separation pipeline")]
struct Args {
    /// Audio file to separate
    #[arg(long)]
    input: PathBuf,

    /// Pre-recorded vocal take to mix once the backing track is ready
    #[arg(long)]
    recording: Option<PathBuf>,

    /// Engine config file (TOML); falls back to the platform config dir
    #[arg(long)]
    config: Option<PathBuf>,

    /// Separation service URL (overrides config file and environment)
    #[arg(long)]
    service_url: Option<String>,

    /// Working directory for per-session stem output
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Start the separation service container stack before processing
    #[arg(long)]
    start_service: bool,

    /// Use the GPU compose profile when starting the service
    #[arg(long, requires = "start_service")]
    gpu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    info!("Starting karaoke-engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::load(args.config.as_deref())?;
    config.service_url = resolve_service_url(args.service_url.as_deref(), &config);
    config.validate()?;
    info!("Separation service: {}", config.service_url);

    let work_root = args
        .work_dir
        .unwrap_or_else(|| std::env::temp_dir().join("karaoke"));

    if args.start_service {
        let manager =
            ServiceManager::discover(&std::env::current_dir()?, args.gpu, CancellationToken::new())
                .ok_or_else(|| {
                    anyhow::anyhow!("Could not find docker/docker-compose.yml above this directory")
                })?;
        manager.start().await?;

        let client = RemoteSeparationClient::new(
            &config.service_url,
            &config.output_format,
            config.bitrate,
        )?;
        info!("Waiting for the separation service to become ready...");
        if !manager
            .wait_for_ready(&client, Duration::from_secs(60))
            .await
        {
            anyhow::bail!("Separation service did not become ready within 60s");
        }
    }

    let bus = EventBus::new(100);
    let mut rx = bus.subscribe();

    let mut orchestrator = SessionOrchestrator::new(config, bus.clone(), work_root);
    let session_id = orchestrator.load_file(&args.input)?;

    // A supplied take stands in for the live recording path: report it as a
    // completed full-track recording so the reconciliation can fire once
    // the stems are ready
    let wants_mix = args.recording.is_some();
    if let Some(recording) = &args.recording {
        let _ = bus.emit(KaraokeEvent::RecordingCompleted {
            session_id,
            path: recording.clone(),
            full_track: true,
            timestamp: chrono::Utc::now(),
        });
    }

    // Control loop: forward every bus event into the orchestrator and stop
    // once the pipeline has reached its terminal state
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped = skipped, "Lagged behind event bus");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        orchestrator.handle_event(&event);

        match &event {
            KaraokeEvent::JobProgress {
                job,
                fraction,
                message,
                ..
            } => {
                info!("[{}] {:>5.1}% {}", job, fraction * 100.0, message);
            }
            KaraokeEvent::SessionWaiting { waiting_for, .. } => match waiting_for {
                WaitingFor::Stems => info!("Recording ready, waiting for stems..."),
                WaitingFor::Recording => info!("Stems ready, waiting for a recording..."),
            },
            KaraokeEvent::MixedTrackReady { path, .. } => {
                info!("Final mix ready: {}", path.display());
            }
            KaraokeEvent::JobFinished {
                job,
                success,
                message,
                ..
            } => {
                if *success {
                    info!("[{}] {}", job, message);
                } else {
                    error!("[{}] {}", job, message);
                }

                match job {
                    JobKind::StemSeparation => {
                        if !success {
                            anyhow::bail!("Stem separation failed: {}", message);
                        }
                        if !wants_mix {
                            info!("No recording supplied; stopping after separation");
                            return Ok(());
                        }
                        // With a recording supplied, a missing backing track
                        // means the mix can never trigger - stop here
                        let backing_exists = orchestrator
                            .session()
                            .map(|s| s.backing_track_path().exists())
                            .unwrap_or(false);
                        if !backing_exists {
                            anyhow::bail!(
                                "Backing track was not generated; cannot mix the recording"
                            );
                        }
                    }
                    JobKind::VocalMix => {
                        if *success {
                            return Ok(());
                        }
                        anyhow::bail!("Vocal mix failed: {}", message);
                    }
                    JobKind::Mixdown => {}
                }
            }
            _ => {}
        }
    }

    Ok(())
}

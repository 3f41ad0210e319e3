//! Separation service lifecycle
//!
//! The separation service normally runs as a docker compose stack shipped
//! next to the project (`docker/docker-compose.yml`, with `cpu` and `gpu`
//! profiles). This manager wraps the compose commands the same way the
//! engine wraps every external tool: supervised subprocesses with hard
//! deadlines, killed rather than abandoned on timeout or cancellation.

use crate::services::process::{self, ToolError};
use crate::services::separation_client::RemoteSeparationClient;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Compose file name, expected under a `docker/` directory
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Image the service containers run from
pub const SERVICE_IMAGE: &str = "karaoke-demucs";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const UP_TIMEOUT: Duration = Duration::from_secs(60);
const DOWN_TIMEOUT: Duration = Duration::from_secs(30);
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Walk up from `start_dir` looking for `docker/docker-compose.yml`
pub fn find_compose_file(start_dir: &Path) -> Option<PathBuf> {
    start_dir
        .ancestors()
        .map(|dir| dir.join("docker").join(COMPOSE_FILE))
        .find(|candidate| candidate.exists())
}

/// Manages the separation service's container stack
pub struct ServiceManager {
    docker: String,
    compose_file: PathBuf,
    use_gpu: bool,
    cancel: CancellationToken,
}

impl ServiceManager {
    pub fn new(
        docker: impl Into<String>,
        compose_file: PathBuf,
        use_gpu: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            docker: docker.into(),
            compose_file,
            use_gpu,
            cancel,
        }
    }

    /// Manager for the compose file discovered above `start_dir`, if any
    pub fn discover(start_dir: &Path, use_gpu: bool, cancel: CancellationToken) -> Option<Self> {
        find_compose_file(start_dir)
            .map(|compose_file| Self::new("docker", compose_file, use_gpu, cancel))
    }

    /// Whether the docker CLI responds to a version probe
    pub async fn docker_available(&self) -> bool {
        self.run(&["--version".to_string()], PROBE_TIMEOUT)
            .await
            .is_ok()
    }

    /// Whether a service container is currently running
    pub async fn container_running(&self) -> Result<bool, ToolError> {
        let args = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("ancestor={}", SERVICE_IMAGE),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let output = self.run(&args, PROBE_TIMEOUT).await?;
        Ok(!output.trim().is_empty())
    }

    /// Bring the service stack up in the background with the configured
    /// profile
    pub async fn start(&self) -> Result<(), ToolError> {
        if !self.docker_available().await {
            return Err(ToolError::NotInvocable(
                "docker is not available; install Docker and try again".to_string(),
            ));
        }

        tracing::info!(
            compose_file = %self.compose_file.display(),
            profile = self.profile(),
            "Starting separation service"
        );
        let args = self.compose_args(&["--profile", self.profile(), "up", "-d"]);
        self.run(&args, UP_TIMEOUT).await?;
        Ok(())
    }

    /// Tear the service stack down
    pub async fn stop(&self) -> Result<(), ToolError> {
        tracing::info!(
            compose_file = %self.compose_file.display(),
            "Stopping separation service"
        );
        let args = self.compose_args(&["down"]);
        self.run(&args, DOWN_TIMEOUT).await?;
        Ok(())
    }

    /// Build the service image (slow; first run or after image changes)
    pub async fn build(&self) -> Result<(), ToolError> {
        tracing::info!(
            compose_file = %self.compose_file.display(),
            "Building separation service image"
        );
        let args = self.compose_args(&["build"]);
        self.run(&args, BUILD_TIMEOUT).await?;
        Ok(())
    }

    /// Poll the service's health endpoint until it answers or `timeout`
    /// elapses. Container start and model load can take a while after
    /// `start` returns.
    pub async fn wait_for_ready(
        &self,
        client: &RemoteSeparationClient,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if client.probe_health().await.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Separation service did not become ready in time"
                );
                return false;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    fn profile(&self) -> &'static str {
        if self.use_gpu {
            "gpu"
        } else {
            "cpu"
        }
    }

    fn compose_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
        ];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<String, ToolError> {
        process::run_supervised(&self.docker, args, timeout, None, &self.cancel, |_, _| {}).await
    }
}
